//! Two-covariance PLDA scoring and AS-Norm score normalization.

pub mod model;
pub mod scorer;

pub use model::PldaModel;
pub use scorer::{as_norm, cohort_stats, PldaScorer};
