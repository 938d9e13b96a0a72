//! Persistent state: the relational voiceprint store and the offline
//! cohort seeding path.

pub mod database;
pub mod seed;
pub mod voiceprint_store;

pub use database::Database;
pub use seed::CohortSeeder;
pub use voiceprint_store::{VerificationAttempt, VoiceprintRecord, VoiceprintStore};
