//! Service configuration loaded from the environment.
//!
//! Every knob has a default that works for local development against a
//! Qdrant instance on localhost; production deployments override through
//! environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for the verification service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Qdrant host name or address.
    pub qdrant_host: String,
    /// Qdrant REST port.
    pub qdrant_port: u16,
    /// Collection holding one centroid per enrolled customer.
    pub enrolled_collection: String,
    /// Collection holding the background-speaker cohort.
    pub cohort_collection: String,
    /// Path to the serialized PLDA model (JSON artifact).
    pub plda_model_path: PathBuf,
    /// ECAPA-TDNN ONNX model: local path or http(s) URL.
    pub ecapa_source: String,
    /// Cache directory for downloaded model files.
    pub ecapa_savedir: PathBuf,
    /// AS-Norm score above which a speaker is accepted.
    pub verification_threshold: f64,
    /// Number of nearest cohort vectors used for normalization.
    pub cohort_top_k: usize,
    /// Minimum audio clips per enrollment.
    pub min_enrollment_samples: usize,
    /// Maximum audio clips per enrollment.
    pub max_enrollment_samples: usize,
    /// Sample rate the encoder expects.
    pub target_sample_rate: u32,
    /// Feature toggle; when false every endpoint answers 503.
    pub voiceprint_enabled: bool,
    /// Whether `encrypted_audio` payloads are accepted.
    pub audio_xor_enabled: bool,
    /// Repeating key for transport de-obfuscation. Not cryptographic.
    pub audio_xor_key: String,
    /// HTTP listen address.
    pub bind_addr: SocketAddr,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Per-call deadline for Qdrant requests.
    pub qdrant_timeout: Duration,
    /// Soft deadline for a full enrollment request.
    pub enroll_timeout: Duration,
    /// Soft deadline for a full verification request.
    pub verify_timeout: Duration,
    /// Size of the bounded pool for CPU-bound inference work.
    pub inference_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let savedir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voicegate")
            .join("models");
        Self {
            qdrant_host: "localhost".to_string(),
            qdrant_port: 6333,
            enrolled_collection: "enrolled_speakers".to_string(),
            cohort_collection: "speaker_cohort".to_string(),
            plda_model_path: PathBuf::from("./models/plda.json"),
            ecapa_source: "./models/ecapa_tdnn.onnx".to_string(),
            ecapa_savedir: savedir,
            verification_threshold: 3.0,
            cohort_top_k: 30,
            min_enrollment_samples: 3,
            max_enrollment_samples: 10,
            target_sample_rate: 16_000,
            voiceprint_enabled: true,
            audio_xor_enabled: false,
            audio_xor_key: String::new(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_path: PathBuf::from("./voicegate.db"),
            qdrant_timeout: Duration::from_secs(5),
            enroll_timeout: Duration::from_secs(30),
            verify_timeout: Duration::from_secs(10),
            inference_workers: 4,
        }
    }
}

impl Config {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            qdrant_host: var_or("QDRANT_HOST", defaults.qdrant_host),
            qdrant_port: parse_var("QDRANT_PORT", defaults.qdrant_port)?,
            enrolled_collection: var_or("ENROLLED_COLLECTION", defaults.enrolled_collection),
            cohort_collection: var_or("COHORT_COLLECTION", defaults.cohort_collection),
            plda_model_path: var_or("PLDA_MODEL_PATH", defaults.plda_model_path.display().to_string()).into(),
            ecapa_source: var_or("ECAPA_SOURCE", defaults.ecapa_source),
            ecapa_savedir: var_or("ECAPA_SAVEDIR", defaults.ecapa_savedir.display().to_string()).into(),
            verification_threshold: parse_var("VERIFICATION_THRESHOLD", defaults.verification_threshold)?,
            cohort_top_k: parse_var("COHORT_TOP_K", defaults.cohort_top_k)?,
            min_enrollment_samples: parse_var("MIN_ENROLLMENT_SAMPLES", defaults.min_enrollment_samples)?,
            max_enrollment_samples: parse_var("MAX_ENROLLMENT_SAMPLES", defaults.max_enrollment_samples)?,
            target_sample_rate: parse_var("TARGET_SAMPLE_RATE", defaults.target_sample_rate)?,
            voiceprint_enabled: parse_bool("VOICEPRINT_ENABLED", defaults.voiceprint_enabled)?,
            audio_xor_enabled: parse_bool("AUDIO_XOR_ENABLED", defaults.audio_xor_enabled)?,
            audio_xor_key: var_or("AUDIO_XOR_KEY", defaults.audio_xor_key),
            bind_addr: parse_var("BIND_ADDR", defaults.bind_addr)?,
            database_path: var_or("DATABASE_PATH", defaults.database_path.display().to_string()).into(),
            qdrant_timeout: Duration::from_secs(parse_var("QDRANT_TIMEOUT_SECS", 5u64)?),
            enroll_timeout: Duration::from_secs(parse_var("ENROLL_TIMEOUT_SECS", 30u64)?),
            verify_timeout: Duration::from_secs(parse_var("VERIFY_TIMEOUT_SECS", 10u64)?),
            inference_workers: parse_var("INFERENCE_WORKERS", defaults.inference_workers)?,
        })
    }

    /// Base URL of the Qdrant REST API.
    pub fn qdrant_url(&self) -> String {
        format!("http://{}:{}", self.qdrant_host, self.qdrant_port)
    }
}

fn var_or(name: &str, default: String) -> String {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default,
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("invalid value for {}: {}", name, v)),
        _ => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => anyhow::bail!("invalid boolean for {}: {}", name, other),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.verification_threshold, 3.0);
        assert_eq!(config.cohort_top_k, 30);
        assert_eq!(config.min_enrollment_samples, 3);
        assert_eq!(config.max_enrollment_samples, 10);
        assert_eq!(config.target_sample_rate, 16_000);
        assert!(config.voiceprint_enabled);
        assert!(!config.audio_xor_enabled);
    }

    #[test]
    fn qdrant_url_combines_host_and_port() {
        let config = Config {
            qdrant_host: "vectors.internal".to_string(),
            qdrant_port: 7000,
            ..Config::default()
        };
        assert_eq!(config.qdrant_url(), "http://vectors.internal:7000");
    }

    #[test]
    fn env_overrides_apply() {
        env::set_var("COHORT_TOP_K", "12");
        env::set_var("VOICEPRINT_ENABLED", "false");
        let config = Config::from_env().unwrap();
        assert_eq!(config.cohort_top_k, 12);
        assert!(!config.voiceprint_enabled);
        env::remove_var("COHORT_TOP_K");
        env::remove_var("VOICEPRINT_ENABLED");
    }
}
