//! The verifier orchestrator: enroll, verify, delete, history, health.
//!
//! Combines the audio loader, the ECAPA encoder, the PLDA scorer, the
//! Qdrant collections, and the relational store. Models are process-wide
//! and read-only; every CPU-bound step runs on the bounded inference pool,
//! and the verify fan-out joins its three branches concurrently before
//! AS-Norm.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::try_join_all;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::audio::AudioLoader;
use crate::config::Config;
use crate::embedding::{l2_normalize, EcapaEmbedder};
use crate::error::{Error, Result};
use crate::plda::{as_norm, cohort_stats, PldaScorer};
use crate::qdrant::QdrantClient;
use crate::storage::{VerificationAttempt, VoiceprintStore};
use crate::verifier::worker::InferencePool;

/// One uploaded audio clip, plus the filename hint it arrived with.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub hint: Option<String>,
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentOutcome {
    pub customer_id: String,
    pub point_id: u64,
    pub num_samples: usize,
}

/// Cohort statistics backing one AS-Norm decision.
#[derive(Debug, Clone, Serialize)]
pub struct CohortStatistics {
    pub enrollment_cohort_mean: f64,
    pub enrollment_cohort_std: f64,
    pub test_cohort_mean: f64,
    pub test_cohort_std: f64,
    pub cohort_size: usize,
}

/// Result of a verification attempt.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub verified: bool,
    pub score: f64,
    pub raw_score: f64,
    pub threshold: f64,
    pub cohort_stats: CohortStatistics,
}

/// Enrolled-user listing entry, straight from centroid payloads.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolledUser {
    pub customer_id: Option<String>,
    pub num_samples: Option<u64>,
}

/// Service health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub cohort_connected: bool,
    pub collections: Vec<String>,
}

/// Derive the deterministic 63-bit vector-store point id for a customer:
/// the first 60 bits of SHA-256(customer_id), reduced mod 2^63.
pub fn point_id(customer_id: &str) -> u64 {
    let digest = Sha256::digest(customer_id.as_bytes());
    let hex = format!("{:x}", digest);
    u64::from_str_radix(&hex[..15], 16).unwrap_or(0) % (1u64 << 63)
}

fn validate_sample_count(got: usize, min: usize, max: usize) -> Result<()> {
    if got < min {
        return Err(Error::TooFewSamples { got, min });
    }
    if got > max {
        return Err(Error::TooManySamples { got, max });
    }
    Ok(())
}

/// Process-wide speaker verifier.
pub struct VoiceVerifier {
    config: Arc<Config>,
    loader: AudioLoader,
    embedder: Arc<EcapaEmbedder>,
    scorer: Arc<PldaScorer>,
    qdrant: QdrantClient,
    store: VoiceprintStore,
    pool: InferencePool,
}

impl VoiceVerifier {
    pub fn new(
        config: Arc<Config>,
        embedder: Arc<EcapaEmbedder>,
        scorer: Arc<PldaScorer>,
        qdrant: QdrantClient,
        store: VoiceprintStore,
    ) -> Self {
        let loader = AudioLoader::new(config.target_sample_rate);
        let pool = InferencePool::new(config.inference_workers);
        Self {
            config,
            loader,
            embedder,
            scorer,
            qdrant,
            store,
            pool,
        }
    }

    /// Startup check: both collections must exist with the encoder's
    /// dimension, recreating on mismatch.
    pub async fn init_collections(&self) -> Result<()> {
        let dim = self.embedder.dim();
        if self.scorer.dim() != dim {
            return Err(Error::internal(format!(
                "PLDA dimension {} does not match encoder dimension {}",
                self.scorer.dim(),
                dim
            )));
        }
        self.qdrant
            .ensure_collection(&self.config.enrolled_collection, dim)
            .await?;
        self.qdrant
            .ensure_collection(&self.config.cohort_collection, dim)
            .await?;
        info!(
            "vector collections ready: '{}' and '{}' (dim {})",
            self.config.enrolled_collection, self.config.cohort_collection, dim
        );
        Ok(())
    }

    /// Decode and embed one clip on the inference pool.
    async fn embed_clip(&self, clip: AudioClip) -> Result<Vec<f32>> {
        let loader = self.loader.clone();
        let embedder = Arc::clone(&self.embedder);
        self.pool
            .run(move || {
                let samples = loader.load(&clip.bytes, clip.hint.as_deref())?;
                embedder.extract(&samples)
            })
            .await
    }

    /// Enroll a customer from several audio clips.
    pub async fn enroll(&self, customer_id: &str, clips: Vec<AudioClip>) -> Result<EnrollmentOutcome> {
        let deadline = self.config.enroll_timeout;
        tokio::time::timeout(deadline, self.enroll_inner(customer_id, clips))
            .await
            .map_err(|_| Error::Timeout { seconds: deadline.as_secs() })?
    }

    async fn enroll_inner(
        &self,
        customer_id: &str,
        clips: Vec<AudioClip>,
    ) -> Result<EnrollmentOutcome> {
        validate_sample_count(
            clips.len(),
            self.config.min_enrollment_samples,
            self.config.max_enrollment_samples,
        )?;
        let num_samples = clips.len();

        // All clips decode and embed in parallel on the bounded pool.
        let embeddings =
            try_join_all(clips.into_iter().map(|clip| self.embed_clip(clip))).await?;

        let dim = self.embedder.dim();
        let mut centroid = vec![0.0f32; dim];
        for embedding in &embeddings {
            for (slot, value) in centroid.iter_mut().zip(embedding.iter()) {
                *slot += value;
            }
        }
        for slot in centroid.iter_mut() {
            *slot /= num_samples as f32;
        }
        l2_normalize(&mut centroid);

        let id = point_id(customer_id);

        // A different customer already owning this point id means the
        // 63-bit hash collided; surface it rather than overwrite.
        if let Some(existing) = self
            .qdrant
            .retrieve(&self.config.enrolled_collection, id)
            .await?
        {
            let owner = existing.payload.get("customer_id").and_then(|v| v.as_str());
            if let Some(owner) = owner {
                if owner != customer_id {
                    return Err(Error::Conflict {
                        message: format!(
                            "point id {} already owned by another customer",
                            id
                        ),
                    });
                }
            }
        }

        let prior = self.store.get_active(customer_id).await?;

        self.qdrant
            .upsert(
                &self.config.enrolled_collection,
                id,
                &centroid,
                json!({ "customer_id": customer_id, "num_samples": num_samples }),
            )
            .await?;

        match self.store.replace(customer_id, id as i64).await {
            Ok(record) => {
                debug!(
                    "enrolled customer {} as voiceprint {} (point {})",
                    customer_id, record.id, id
                );
            }
            Err(e) => {
                // A fresh enrollment that failed relationally must not
                // leave an orphan centroid behind.
                if prior.is_none() {
                    if let Err(cleanup) = self
                        .qdrant
                        .delete_point(&self.config.enrolled_collection, id)
                        .await
                    {
                        warn!("failed to roll back centroid {}: {}", id, cleanup);
                    }
                }
                return Err(e);
            }
        }

        Ok(EnrollmentOutcome {
            customer_id: customer_id.to_string(),
            point_id: id,
            num_samples,
        })
    }

    /// Verify one clip against a customer's enrolled centroid.
    pub async fn verify(&self, customer_id: &str, clip: AudioClip) -> Result<VerifyOutcome> {
        let deadline = self.config.verify_timeout;
        tokio::time::timeout(deadline, self.verify_inner(customer_id, clip))
            .await
            .map_err(|_| Error::Timeout { seconds: deadline.as_secs() })?
    }

    async fn verify_inner(&self, customer_id: &str, clip: AudioClip) -> Result<VerifyOutcome> {
        let test_embedding = self.embed_clip(clip).await?;

        let record = self
            .store
            .get_active(customer_id)
            .await?
            .ok_or_else(|| Error::NotEnrolled { customer_id: customer_id.to_string() })?;

        let enrolled_point = self
            .qdrant
            .retrieve(&self.config.enrolled_collection, record.qdrant_vector_id as u64)
            .await?
            .ok_or_else(|| Error::NotEnrolled { customer_id: customer_id.to_string() })?;
        let enroll_embedding = enrolled_point.vector;

        // Raw PLDA score and both cohort lookups proceed concurrently.
        let k = self.config.cohort_top_k;
        let raw_future = {
            let scorer = Arc::clone(&self.scorer);
            let enroll = enroll_embedding.clone();
            let test = test_embedding.clone();
            self.pool.run(move || scorer.score(&enroll, &test))
        };
        let cohort_enroll_future =
            self.qdrant
                .top_k(&self.config.cohort_collection, &enroll_embedding, k);
        let cohort_test_future =
            self.qdrant
                .top_k(&self.config.cohort_collection, &test_embedding, k);

        let (raw_score, cohort_enroll, cohort_test) =
            tokio::try_join!(raw_future, cohort_enroll_future, cohort_test_future)?;

        if cohort_enroll.is_empty() || cohort_test.is_empty() {
            return Err(Error::CohortUnavailable);
        }

        // Each embedding is normalized against its own nearest cohort.
        let scores_enroll = {
            let scorer = Arc::clone(&self.scorer);
            let enroll = enroll_embedding.clone();
            self.pool
                .run(move || scorer.cohort_scores(&enroll, &cohort_enroll))
                .await?
        };
        let scores_test = {
            let scorer = Arc::clone(&self.scorer);
            let test = test_embedding.clone();
            self.pool
                .run(move || scorer.cohort_scores(&test, &cohort_test))
                .await?
        };

        let (mu_e, sigma_e) = cohort_stats(&scores_enroll);
        let (mu_t, sigma_t) = cohort_stats(&scores_test);
        let score = as_norm(raw_score, &scores_enroll, &scores_test);

        let threshold = self.config.verification_threshold;
        let verified = score > threshold;
        info!(
            "verify customer {}: raw {:.3}, as-norm {:.3}, threshold {:.1}, verified {}",
            customer_id, raw_score, score, threshold, verified
        );

        self.store
            .append_attempt(record.id, raw_score, score, threshold)
            .await?;
        if verified {
            self.store.mark_verified(record.id, Utc::now()).await?;
        }

        Ok(VerifyOutcome {
            verified,
            score,
            raw_score,
            threshold,
            cohort_stats: CohortStatistics {
                enrollment_cohort_mean: mu_e,
                enrollment_cohort_std: sigma_e,
                test_cohort_mean: mu_t,
                test_cohort_std: sigma_t,
                cohort_size: k,
            },
        })
    }

    /// Remove a customer's voiceprint and, when no sibling rows remain,
    /// its centroid. Returns false when nothing was enrolled.
    pub async fn delete(&self, customer_id: &str) -> Result<bool> {
        let deleted = self.store.delete(customer_id).await?;
        if !deleted {
            return Ok(false);
        }

        let remaining = self.store.count_for_customer(customer_id).await?;
        if remaining == 0 {
            self.qdrant
                .delete_point(&self.config.enrolled_collection, point_id(customer_id))
                .await?;
        }
        info!("deleted voiceprint for customer {}", customer_id);
        Ok(true)
    }

    /// Verification attempt history, newest first.
    pub async fn history(&self, customer_id: &str) -> Result<Vec<VerificationAttempt>> {
        self.store
            .history(customer_id)
            .await?
            .ok_or_else(|| Error::NotFound { customer_id: customer_id.to_string() })
    }

    /// List enrolled users from centroid payloads.
    pub async fn list_enrolled(&self, limit: usize) -> Result<Vec<EnrolledUser>> {
        let payloads = self
            .qdrant
            .scroll_payloads(&self.config.enrolled_collection, limit)
            .await?;
        Ok(payloads
            .into_iter()
            .map(|payload| EnrolledUser {
                customer_id: payload
                    .get("customer_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                num_samples: payload.get("num_samples").and_then(|v| v.as_u64()),
            })
            .collect())
    }

    /// Health snapshot: vector store reachability and collection listing.
    pub async fn health(&self) -> HealthReport {
        match self.qdrant.list_collections().await {
            Ok(collections) => HealthReport {
                status: "healthy",
                cohort_connected: true,
                collections,
            },
            Err(e) => {
                warn!("health check failed: {}", e);
                HealthReport {
                    status: "unhealthy",
                    cohort_connected: false,
                    collections: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_deterministic() {
        assert_eq!(point_id("alice"), point_id("alice"));
        assert_ne!(point_id("alice"), point_id("bob"));
    }

    #[test]
    fn point_id_fits_sixty_three_bits() {
        for customer in ["alice", "bob", "customer-12345", "日本語"] {
            assert!(point_id(customer) < (1u64 << 63));
        }
    }

    #[test]
    fn point_id_of_empty_string_is_still_valid() {
        // Degenerate but allowed upstream; must not panic.
        let id = point_id("");
        assert!(id < (1u64 << 63));
    }

    #[test]
    fn sample_count_boundaries() {
        assert!(validate_sample_count(3, 3, 10).is_ok());
        assert!(validate_sample_count(10, 3, 10).is_ok());

        let too_few = validate_sample_count(2, 3, 10).unwrap_err();
        assert_eq!(too_few.code(), "too_few_samples");

        let too_many = validate_sample_count(11, 3, 10).unwrap_err();
        assert_eq!(too_many.code(), "too_many_samples");
    }
}
