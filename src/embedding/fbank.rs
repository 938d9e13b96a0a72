//! Kaldi-style log-mel filterbank features.
//!
//! The ECAPA encoder consumes 80-bin log-mel features computed over 25 ms
//! frames with a 10 ms hop: pre-emphasis, Povey window, power spectrum via
//! FFT, triangular mel filterbank, natural log. Per-utterance cepstral mean
//! normalization happens separately in [`cmvn`] so callers can skip it for
//! models that normalize internally.

use ndarray::Array2;
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Filterbank extraction parameters.
#[derive(Debug, Clone)]
pub struct FbankConfig {
    pub sample_rate: u32,
    /// Number of mel bins.
    pub num_bins: usize,
    /// Frame length in samples (25 ms at 16 kHz).
    pub frame_length: usize,
    /// Frame shift in samples (10 ms at 16 kHz).
    pub frame_shift: usize,
    /// Lower edge of the mel filterbank in Hz.
    pub low_freq: f32,
    /// Upper edge of the mel filterbank in Hz.
    pub high_freq: f32,
    /// Pre-emphasis coefficient.
    pub pre_emphasis: f32,
}

impl Default for FbankConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            num_bins: 80,
            frame_length: 400,
            frame_shift: 160,
            low_freq: 20.0,
            high_freq: 7_600.0,
            pre_emphasis: 0.97,
        }
    }
}

impl FbankConfig {
    /// FFT size: the next power of two above the frame length.
    pub fn fft_size(&self) -> usize {
        self.frame_length.next_power_of_two()
    }

    /// Number of frames produced for `num_samples` of input.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        if num_samples < self.frame_length {
            0
        } else {
            (num_samples - self.frame_length) / self.frame_shift + 1
        }
    }
}

/// Compute log-mel filterbank features for a mono clip.
///
/// Returns `None` when the clip is shorter than a single frame.
pub fn compute_fbank(samples: &[f32], cfg: &FbankConfig) -> Option<Array2<f32>> {
    let num_frames = cfg.num_frames(samples.len());
    if num_frames == 0 {
        return None;
    }

    let fft_size = cfg.fft_size();
    let num_fft_bins = fft_size / 2 + 1;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);
    let window = povey_window(cfg.frame_length);
    let filterbank = mel_filterbank(cfg, num_fft_bins);

    let mut features = Array2::<f32>::zeros((num_frames, cfg.num_bins));
    let mut buf = vec![Complex32::new(0.0, 0.0); fft_size];
    let mut power = vec![0.0f32; num_fft_bins];

    for frame_idx in 0..num_frames {
        let start = frame_idx * cfg.frame_shift;
        let frame = &samples[start..start + cfg.frame_length];

        // Pre-emphasis and windowing into the zero-padded FFT buffer.
        for slot in buf.iter_mut() {
            *slot = Complex32::new(0.0, 0.0);
        }
        for i in 0..cfg.frame_length {
            let prev = if i == 0 { frame[0] } else { frame[i - 1] };
            let emphasized = frame[i] - cfg.pre_emphasis * prev;
            buf[i] = Complex32::new(emphasized * window[i], 0.0);
        }

        fft.process(&mut buf);

        for (bin, slot) in power.iter_mut().enumerate() {
            *slot = buf[bin].norm_sqr();
        }

        for (mel_idx, filter) in filterbank.iter().enumerate() {
            let mut energy = 0.0f32;
            for &(bin, weight) in filter {
                energy += power[bin] * weight;
            }
            features[(frame_idx, mel_idx)] = energy.max(f32::EPSILON).ln();
        }
    }

    Some(features)
}

/// Per-utterance cepstral mean normalization: subtract the per-bin mean.
pub fn cmvn(features: &mut Array2<f32>) {
    let num_frames = features.nrows();
    if num_frames == 0 {
        return;
    }
    for mut column in features.columns_mut() {
        let mean = column.iter().sum::<f32>() / num_frames as f32;
        column.iter_mut().for_each(|x| *x -= mean);
    }
}

/// Povey window: Hann raised to the power 0.85, the Kaldi default.
fn povey_window(length: usize) -> Vec<f32> {
    (0..length)
        .map(|i| {
            let hann =
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (length as f32 - 1.0)).cos();
            hann.powf(0.85)
        })
        .collect()
}

fn hz_to_mel(hz: f32) -> f32 {
    1127.0 * (1.0 + hz / 700.0).ln()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * ((mel / 1127.0).exp() - 1.0)
}

/// Sparse triangular mel filters: per bin, the (fft_bin, weight) pairs.
fn mel_filterbank(cfg: &FbankConfig, num_fft_bins: usize) -> Vec<Vec<(usize, f32)>> {
    let fft_size = cfg.fft_size();
    let nyquist = cfg.sample_rate as f32 / 2.0;
    let high = cfg.high_freq.min(nyquist);

    let mel_low = hz_to_mel(cfg.low_freq);
    let mel_high = hz_to_mel(high);
    let edges: Vec<f32> = (0..cfg.num_bins + 2)
        .map(|i| {
            let mel = mel_low + (mel_high - mel_low) * i as f32 / (cfg.num_bins + 1) as f32;
            mel_to_hz(mel)
        })
        .collect();

    let hz_per_bin = cfg.sample_rate as f32 / fft_size as f32;
    let mut filters = Vec::with_capacity(cfg.num_bins);

    for mel_idx in 0..cfg.num_bins {
        let left = edges[mel_idx];
        let center = edges[mel_idx + 1];
        let right = edges[mel_idx + 2];
        let mut filter = Vec::new();

        for bin in 0..num_fft_bins {
            let freq = bin as f32 * hz_per_bin;
            let weight = if freq > left && freq < center {
                (freq - left) / (center - left)
            } else if freq >= center && freq < right {
                (right - freq) / (right - center)
            } else {
                0.0
            };
            if weight > 0.0 {
                filter.push((bin, weight));
            }
        }
        filters.push(filter);
    }

    filters
}
