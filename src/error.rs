//! Error kinds surfaced by the verification core.
//!
//! Each variant carries a stable code that the HTTP layer maps onto a
//! status. Nothing is retried inside the core; transient store failures
//! surface as `StoreUnavailable` and the caller decides whether to retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Decode failed, empty input, or the payload is not audio.
    #[error("bad audio: {message}")]
    BadAudio { message: String },

    /// No decoder backend covers the submitted format.
    #[error("unsupported audio format: {format}")]
    Unsupported { format: String },

    /// Enrollment submitted fewer clips than the configured minimum.
    #[error("at least {min} audio samples required, got {got}")]
    TooFewSamples { got: usize, min: usize },

    /// Enrollment submitted more clips than the configured maximum.
    #[error("at most {max} audio samples allowed, got {got}")]
    TooManySamples { got: usize, max: usize },

    /// Verification against a customer with no active voiceprint.
    #[error("Customer {customer_id} not found")]
    NotEnrolled { customer_id: String },

    /// No voiceprint exists for the requested customer.
    #[error("no voiceprint for customer {customer_id}")]
    NotFound { customer_id: String },

    /// Cohort store reachable but returned fewer vectors than required.
    #[error("cohort empty; populate the cohort collection first")]
    CohortUnavailable,

    /// Vector store or relational store network/timeout failure.
    #[error("store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Two simultaneous enrollments collided, or a point id hash collision.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// The request exceeded its soft deadline.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The voiceprint feature toggle is off.
    #[error("voiceprint service is disabled")]
    ServiceDisabled,

    /// Model failures and invariant violations.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Stable machine-readable code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadAudio { .. } => "bad_audio",
            Error::Unsupported { .. } => "unsupported_format",
            Error::TooFewSamples { .. } => "too_few_samples",
            Error::TooManySamples { .. } => "too_many_samples",
            Error::NotEnrolled { .. } => "not_enrolled",
            Error::NotFound { .. } => "not_found",
            Error::CohortUnavailable => "cohort_unavailable",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::Conflict { .. } => "conflict",
            Error::Timeout { .. } => "timeout",
            Error::ServiceDisabled => "service_disabled",
            Error::Internal { .. } => "internal",
        }
    }

    pub fn bad_audio(message: impl Into<String>) -> Self {
        Error::BadAudio { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal { message: message.into() }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Error::StoreUnavailable { message: message.into() }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal { message: format!("{:#}", err) }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreUnavailable { message: err.to_string() }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::StoreUnavailable { message: "vector store request timed out".to_string() }
        } else {
            Error::StoreUnavailable { message: err.to_string() }
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal { message: format!("worker task failed: {}", err) }
    }
}
