//! Sample-rate conversion for decoded audio.
//!
//! Offline windowed-sinc resampling used to bring arbitrary source rates to
//! the encoder's 16 kHz. Quality is tuned for short utterances where the
//! whole clip is in memory, not for streaming.

use tracing::debug;

use crate::error::{Error, Result};

/// Half-width of the sinc interpolation window, in source samples.
const SINC_HALF_WIDTH: usize = 32;

/// Windowed-sinc resampler between two fixed rates.
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    ratio: f64,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(Error::bad_audio("sample rates must be greater than zero"));
        }
        let ratio = target_rate as f64 / source_rate as f64;
        debug!(
            "resampler: {} Hz -> {} Hz (ratio {:.4})",
            source_rate, target_rate, ratio
        );
        Ok(Self { source_rate, target_rate, ratio })
    }

    /// Resample a whole mono clip. A no-op copy when rates already match.
    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        if self.source_rate == self.target_rate || input.is_empty() {
            return input.to_vec();
        }

        let output_len = ((input.len() as f64) * self.ratio).round() as usize;
        let mut output = Vec::with_capacity(output_len);

        // When downsampling, band-limit below the new Nyquist frequency.
        let cutoff = self.ratio.min(1.0);

        for out_idx in 0..output_len {
            let center = out_idx as f64 / self.ratio;
            let center_floor = center.floor() as isize;

            let mut acc = 0.0f64;
            let mut weight_sum = 0.0f64;
            let lo = center_floor - SINC_HALF_WIDTH as isize + 1;
            let hi = center_floor + SINC_HALF_WIDTH as isize;
            for src_idx in lo..=hi {
                if src_idx < 0 || src_idx as usize >= input.len() {
                    continue;
                }
                let x = (src_idx as f64 - center) * cutoff;
                let weight = sinc(x) * hann(src_idx as f64 - center);
                acc += input[src_idx as usize] as f64 * weight;
                weight_sum += weight;
            }

            if weight_sum.abs() > f64::EPSILON {
                output.push((acc / weight_sum) as f32);
            } else {
                output.push(0.0);
            }
        }

        output
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Hann window over the interpolation neighborhood.
fn hann(offset: f64) -> f64 {
    let half = SINC_HALF_WIDTH as f64;
    if offset.abs() >= half {
        return 0.0;
    }
    0.5 * (1.0 + (std::f64::consts::PI * offset / half).cos())
}
