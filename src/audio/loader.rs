//! Decode uploaded audio bytes into 16 kHz mono float32 samples.
//!
//! The primary path probes the bytes with symphonia (WAV, FLAC, OGG/Vorbis,
//! MP3). Browser recordings frequently arrive as WebM/Opus regardless of the
//! filename they were saved under, so on probe failure the loader shells out
//! to ffmpeg to transcode into 16 kHz mono s16 WAV and re-reads the result.
//! Temp files are scoped and removed on every exit path.

use std::io::Cursor;
use std::io::Write;
use std::process::Command;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::resampler::Resampler;
use crate::error::{Error, Result};

/// Container format detected from the first bytes of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedFormat {
    /// RIFF/WAVE container.
    Wave,
    /// Native FLAC stream.
    Flac,
    /// MPEG audio (ID3 tag or frame sync).
    Mpeg,
    /// Ogg container (Vorbis or Opus).
    Ogg,
    /// EBML container (WebM/Matroska, typically Opus from browsers).
    Ebml,
    Unknown,
}

impl SniffedFormat {
    /// Extension hint handed to the symphonia probe.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            SniffedFormat::Wave => Some("wav"),
            SniffedFormat::Flac => Some("flac"),
            SniffedFormat::Mpeg => Some("mp3"),
            SniffedFormat::Ogg => Some("ogg"),
            SniffedFormat::Ebml => Some("webm"),
            SniffedFormat::Unknown => None,
        }
    }
}

/// Identify a payload from its magic bytes. Declared filename suffixes lie
/// often enough that sniffing wins whenever it is conclusive.
pub fn sniff_format(bytes: &[u8]) -> SniffedFormat {
    if bytes.len() < 12 {
        return SniffedFormat::Unknown;
    }
    if &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return SniffedFormat::Wave;
    }
    if &bytes[0..4] == b"fLaC" {
        return SniffedFormat::Flac;
    }
    if &bytes[0..4] == b"OggS" {
        return SniffedFormat::Ogg;
    }
    if &bytes[0..3] == b"ID3" || (bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0) {
        return SniffedFormat::Mpeg;
    }
    if bytes[0] == 0x1A && bytes[1] == 0x45 && bytes[2] == 0xDF && bytes[3] == 0xA3 {
        return SniffedFormat::Ebml;
    }
    SniffedFormat::Unknown
}

/// Decoder front-end for uploaded audio.
#[derive(Clone)]
pub struct AudioLoader {
    target_rate: u32,
}

impl AudioLoader {
    pub fn new(target_rate: u32) -> Self {
        Self { target_rate }
    }

    /// Decode `bytes` into mono f32 samples at the target rate.
    ///
    /// `hint` is a filename or extension from the upload; the sniffed magic
    /// bytes override it when they disagree.
    pub fn load(&self, bytes: &[u8], hint: Option<&str>) -> Result<Vec<f32>> {
        if bytes.is_empty() {
            return Err(Error::bad_audio("empty audio payload"));
        }

        let sniffed = sniff_format(bytes);
        let ext = sniffed
            .extension()
            .or_else(|| hint.and_then(extension_of));
        if let (Some(declared), Some(detected)) = (hint.and_then(extension_of), sniffed.extension()) {
            if declared != detected {
                debug!(
                    "declared suffix '{}' disagrees with sniffed '{}'; trusting magic bytes",
                    declared, detected
                );
            }
        }

        let (samples, source_rate) = match self.decode_with_symphonia(bytes, ext) {
            Ok(decoded) => decoded,
            Err(primary_err) => {
                debug!("primary decode failed ({}), falling back to ffmpeg", primary_err);
                self.decode_with_ffmpeg(bytes, ext)?
            }
        };

        if samples.is_empty() {
            return Err(Error::bad_audio("decoded audio contains no samples"));
        }

        if source_rate == self.target_rate {
            Ok(samples)
        } else {
            let resampler = Resampler::new(source_rate, self.target_rate)?;
            Ok(resampler.process(&samples))
        }
    }

    /// Probe and decode with symphonia, downmixing to mono.
    fn decode_with_symphonia(&self, bytes: &[u8], ext: Option<&str>) -> Result<(Vec<f32>, u32)> {
        let cursor = Cursor::new(bytes.to_vec());
        let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = ext {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::bad_audio(format!("failed to probe format: {}", e)))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::bad_audio("no decodable audio track"))?;
        let track_id = track.id;

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::bad_audio(format!("failed to create decoder: {}", e)))?;

        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
        let mut channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(1);
        let mut interleaved: Vec<f32> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(Error::bad_audio(format!("demux error: {}", e))),
            };
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count();
                    let mut buf =
                        SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    interleaved.extend_from_slice(buf.samples());
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Skip corrupt packets the way lenient players do.
                    warn!("skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(Error::bad_audio(format!("decode error: {}", e))),
            }
        }

        if sample_rate == 0 {
            return Err(Error::bad_audio("source sample rate unknown"));
        }

        Ok((downmix(&interleaved, channels), sample_rate))
    }

    /// Transcode with ffmpeg into 16 kHz mono s16 WAV, then re-read.
    ///
    /// Both temp files are owned by `NamedTempFile` guards and removed when
    /// this function returns, on success and on every error path.
    fn decode_with_ffmpeg(&self, bytes: &[u8], ext: Option<&str>) -> Result<(Vec<f32>, u32)> {
        let mut input = tempfile::Builder::new()
            .prefix("voicegate-in-")
            .suffix(&format!(".{}", ext.unwrap_or("bin")))
            .tempfile()
            .map_err(|e| Error::internal(format!("failed to create temp file: {}", e)))?;
        input
            .write_all(bytes)
            .map_err(|e| Error::internal(format!("failed to write temp file: {}", e)))?;
        input
            .flush()
            .map_err(|e| Error::internal(format!("failed to flush temp file: {}", e)))?;

        let output = tempfile::Builder::new()
            .prefix("voicegate-out-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| Error::internal(format!("failed to create temp file: {}", e)))?;

        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input.path())
            .args(["-ar", &self.target_rate.to_string()])
            .args(["-ac", "1"])
            .args(["-sample_fmt", "s16"])
            .args(["-f", "wav"])
            .arg(output.path())
            .output();

        let result = match result {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Unsupported {
                    format: format!(
                        "{} (ffmpeg not installed, no backend covers this format)",
                        ext.unwrap_or("unknown")
                    ),
                });
            }
            Err(e) => return Err(Error::internal(format!("failed to spawn ffmpeg: {}", e))),
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(Error::bad_audio(format!(
                "ffmpeg transcode failed (exit {:?}): {}",
                result.status.code(),
                tail
            )));
        }

        let mut reader = hound::WavReader::open(output.path())
            .map_err(|e| Error::bad_audio(format!("failed to read transcoded wav: {}", e)))?;
        let spec = reader.spec();
        let samples: Vec<f32> = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<i16>, _>>()
            .map_err(|e| Error::bad_audio(format!("failed to read transcoded samples: {}", e)))?
            .into_iter()
            .map(|s| s as f32 / 32_768.0)
            .collect();

        Ok((downmix(&samples, spec.channels as usize), spec.sample_rate))
    }
}

/// Average interleaved channels down to mono.
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn extension_of(hint: &str) -> Option<&str> {
    let trimmed = hint.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => Some(ext),
        // A bare extension like "wav" is accepted as-is.
        None if !trimmed.contains('/') => Some(trimmed),
        _ => None,
    }
}
