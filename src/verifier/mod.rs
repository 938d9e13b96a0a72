//! Request-level orchestration of enrollment, verification, and deletion.

pub mod service;
pub mod worker;

pub use service::{
    AudioClip, CohortStatistics, EnrolledUser, EnrollmentOutcome, HealthReport, VerifyOutcome,
    VoiceVerifier,
};
pub use worker::InferencePool;
