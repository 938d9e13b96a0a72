//! Fast two-covariance PLDA log-likelihood-ratio scoring.
//!
//! The expensive matrix work happens once at construction: the verification
//! path only pays two matrix-vector products per score. All intermediates
//! are f64. The scorer is immutable after construction and safe to share
//! across threads.

use anyhow::{Context, Result};
use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::info;

use crate::error::Error;
use crate::plda::model::PldaModel;

/// Floor applied to cohort standard deviations in AS-Norm denominators.
const SIGMA_FLOOR: f64 = 1e-8;

/// Precomputed PLDA scoring machine.
///
/// `score` evaluates the log-likelihood ratio between "same speaker" and
/// "different speakers" hypotheses:
///
/// ```text
/// llr(e, t) = s * ( 1/2 e'Φe + 1/2 t'Φt + e'Ψt + const )
/// ```
///
/// with embeddings centered by the model mean, Φ and Ψ derived from the
/// between-speaker covariance F·F' and residual covariance Σ, and `const`
/// the Gaussian normalization term.
pub struct PldaScorer {
    mean: DVector<f64>,
    phi: DMatrix<f64>,
    psi: DMatrix<f64>,
    constant: f64,
    scaling_factor: f64,
    dim: usize,
}

impl PldaScorer {
    /// Build the scorer, caching every decomposition the hot path needs.
    pub fn new(model: &PldaModel) -> Result<Self> {
        let dim = model.dim();
        let subspace = model.f.ncols();

        let inv_sigma = spd_inverse(&model.sigma).context("PLDA Sigma is not positive definite")?;

        // Gaussian constant from the speaker-subspace precisions.
        let k = model.f.transpose() * (&inv_sigma * model.scaling_factor) * &model.f;
        let identity = DMatrix::<f64>::identity(subspace, subspace);
        let log_det_k1 = spd_log_det(&(&k + &identity))
            .context("PLDA K + I is not positive definite")?;
        let log_det_k2 = spd_log_det(&(&k * 2.0 + &identity))
            .context("PLDA 2K + I is not positive definite")?;
        // slogdet((K+I)^-1) = -logdet(K+I); same for 2K+I.
        let constant = log_det_k1 - log_det_k2 / 2.0;

        // Within/between decomposition of the total covariance.
        let sigma_ac = &model.f * model.f.transpose();
        let sigma_tot = &sigma_ac + &model.sigma;
        let sigma_tot_inv =
            spd_inverse(&sigma_tot).context("PLDA total covariance is not positive definite")?;
        let schur = &sigma_tot - &sigma_ac * &sigma_tot_inv * &sigma_ac;
        let tmp = spd_inverse(&schur)
            .context("PLDA Schur complement is not positive definite")?;
        let phi = &sigma_tot_inv - &tmp;
        let psi = &sigma_tot_inv * &sigma_ac * &tmp;

        info!(
            "PLDA scorer ready: dim {}, speaker subspace {}, scaling {}",
            dim, subspace, model.scaling_factor
        );

        Ok(Self {
            mean: model.mean.clone(),
            phi,
            psi,
            constant,
            scaling_factor: model.scaling_factor,
            dim,
        })
    }

    /// Embedding dimensionality the scorer expects.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Raw log-likelihood-ratio score between two embeddings.
    pub fn score(&self, enroll: &[f32], test: &[f32]) -> crate::error::Result<f64> {
        let e = self.center(enroll)?;
        let t = self.center(test)?;

        let quad_e = 0.5 * e.dot(&(&self.phi * &e));
        let quad_t = 0.5 * t.dot(&(&self.phi * &t));
        let cross = e.dot(&(&self.psi * &t));

        Ok(self.scaling_factor * (quad_e + quad_t + cross + self.constant))
    }

    /// Score one reference embedding against a batch of cohort vectors.
    ///
    /// Equivalent to calling [`score`](Self::score) once per cohort vector,
    /// but the quadratic and cross terms are evaluated as two matrix
    /// products over the whole batch.
    pub fn cohort_scores(
        &self,
        reference: &[f32],
        cohort: &[Vec<f32>],
    ) -> crate::error::Result<Vec<f64>> {
        if cohort.is_empty() {
            return Ok(Vec::new());
        }

        let r = self.center(reference)?;
        let quad_ref = 0.5 * r.dot(&(&self.phi * &r));
        // r'Ψc == (Ψ'r)·c for each cohort row.
        let psi_r = self.psi.transpose() * &r;

        let k = cohort.len();
        let mut centered = DMatrix::<f64>::zeros(k, self.dim);
        for (row, vector) in cohort.iter().enumerate() {
            if vector.len() != self.dim {
                return Err(Error::internal(format!(
                    "cohort vector has dimension {}, expected {}",
                    vector.len(),
                    self.dim
                )));
            }
            for (col, &value) in vector.iter().enumerate() {
                centered[(row, col)] = value as f64 - self.mean[col];
            }
        }

        let phi_rows = &centered * &self.phi;
        let cross = &centered * &psi_r;

        let mut scores = Vec::with_capacity(k);
        for row in 0..k {
            let quad_c = 0.5 * phi_rows.row(row).dot(&centered.row(row));
            scores.push(
                self.scaling_factor * (quad_ref + quad_c + cross[row] + self.constant),
            );
        }
        Ok(scores)
    }

    fn center(&self, embedding: &[f32]) -> crate::error::Result<DVector<f64>> {
        if embedding.len() != self.dim {
            return Err(Error::internal(format!(
                "embedding has dimension {}, expected {}",
                embedding.len(),
                self.dim
            )));
        }
        Ok(DVector::from_iterator(
            self.dim,
            embedding
                .iter()
                .zip(self.mean.iter())
                .map(|(&x, &m)| x as f64 - m),
        ))
    }
}

/// Mean and standard deviation of a cohort score set, with the deviation
/// floored at [`SIGMA_FLOOR`] so degenerate cohorts never divide by zero.
pub fn cohort_stats(scores: &[f64]) -> (f64, f64) {
    if scores.is_empty() {
        return (0.0, SIGMA_FLOOR);
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt().max(SIGMA_FLOOR))
}

/// Adaptive symmetric score normalization.
///
/// `z = 1/2 ((raw - mu_e)/sigma_e + (raw - mu_t)/sigma_t)` where the
/// statistics come from the cohort scores of the enrollment and test
/// embeddings. Symmetric: swapping the two score sets leaves z unchanged.
pub fn as_norm(raw: f64, enroll_scores: &[f64], test_scores: &[f64]) -> f64 {
    let (mu_e, sigma_e) = cohort_stats(enroll_scores);
    let (mu_t, sigma_t) = cohort_stats(test_scores);
    0.5 * ((raw - mu_e) / sigma_e + (raw - mu_t) / sigma_t)
}

fn spd_inverse(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    Cholesky::new(matrix.clone())
        .map(|c| c.inverse())
        .ok_or_else(|| anyhow::anyhow!("matrix is not positive definite"))
}

fn spd_log_det(matrix: &DMatrix<f64>) -> Result<f64> {
    let chol = Cholesky::new(matrix.clone())
        .ok_or_else(|| anyhow::anyhow!("matrix is not positive definite"))?;
    Ok(2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Random but well-conditioned PLDA model for numeric tests.
    fn synthetic_model(dim: usize, subspace: usize, seed: u64) -> PldaModel {
        let mut rng = StdRng::seed_from_u64(seed);
        let mean: Vec<f64> = (0..dim).map(|_| rng.gen_range(-0.1..0.1)).collect();
        let f: Vec<Vec<f64>> = (0..dim)
            .map(|_| (0..subspace).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        // Sigma = A A' + dim * I keeps it comfortably positive definite.
        let a: Vec<Vec<f64>> = (0..dim)
            .map(|_| (0..dim).map(|_| rng.gen_range(-0.5..0.5)).collect())
            .collect();
        let mut sigma = vec![vec![0.0; dim]; dim];
        for i in 0..dim {
            for j in 0..dim {
                let mut dot = 0.0;
                for (ai, aj) in a[i].iter().zip(a[j].iter()) {
                    dot += ai * aj;
                }
                sigma[i][j] = dot + if i == j { dim as f64 } else { 0.0 };
            }
        }

        PldaModel::from_parts(mean, f, sigma, 1.0).unwrap()
    }

    fn random_embedding(dim: usize, rng: &mut StdRng) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        crate::embedding::l2_normalize(&mut v);
        v
    }

    #[test]
    fn batched_cohort_scores_match_individual_scores() {
        let model = synthetic_model(16, 6, 7);
        let scorer = PldaScorer::new(&model).unwrap();
        let mut rng = StdRng::seed_from_u64(11);

        let reference = random_embedding(16, &mut rng);
        let cohort: Vec<Vec<f32>> = (0..25).map(|_| random_embedding(16, &mut rng)).collect();

        let batched = scorer.cohort_scores(&reference, &cohort).unwrap();
        assert_eq!(batched.len(), cohort.len());

        for (i, vector) in cohort.iter().enumerate() {
            let single = scorer.score(&reference, vector).unwrap();
            let denom = single.abs().max(1e-12);
            assert!(
                ((batched[i] - single) / denom).abs() < 1e-4,
                "batched {} != single {} at index {}",
                batched[i],
                single,
                i
            );
        }
    }

    #[test]
    fn score_is_symmetric_in_its_arguments() {
        let model = synthetic_model(12, 4, 3);
        let scorer = PldaScorer::new(&model).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let a = random_embedding(12, &mut rng);
        let b = random_embedding(12, &mut rng);

        let ab = scorer.score(&a, &b).unwrap();
        let ba = scorer.score(&b, &a).unwrap();
        assert!((ab - ba).abs() < 1e-9, "score(a,b)={} score(b,a)={}", ab, ba);
    }

    #[test]
    fn same_vector_scores_higher_than_random_pair() {
        let model = synthetic_model(16, 8, 21);
        let scorer = PldaScorer::new(&model).unwrap();
        let mut rng = StdRng::seed_from_u64(22);
        let a = random_embedding(16, &mut rng);
        let b = random_embedding(16, &mut rng);

        let same = scorer.score(&a, &a).unwrap();
        let different = scorer.score(&a, &b).unwrap();
        assert!(same > different, "same={} different={}", same, different);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let model = synthetic_model(8, 3, 1);
        let scorer = PldaScorer::new(&model).unwrap();
        let short = vec![0.5f32; 4];
        let ok = vec![0.5f32; 8];
        assert!(scorer.score(&short, &ok).is_err());
        assert!(scorer.cohort_scores(&ok, &[short]).is_err());
    }

    #[test]
    fn empty_cohort_scores_to_empty() {
        let model = synthetic_model(8, 3, 1);
        let scorer = PldaScorer::new(&model).unwrap();
        let reference = vec![0.1f32; 8];
        assert!(scorer.cohort_scores(&reference, &[]).unwrap().is_empty());
    }

    #[test]
    fn cohort_stats_floors_sigma() {
        let constant = vec![2.5; 10];
        let (mean, sigma) = cohort_stats(&constant);
        assert!((mean - 2.5).abs() < 1e-12);
        assert_eq!(sigma, SIGMA_FLOOR);

        // Degenerate cohort must not blow up normalization.
        let z = as_norm(2.5, &constant, &constant);
        assert!(z.is_finite());
        assert_eq!(z, 0.0);
    }

    #[test]
    fn as_norm_standardizes_against_cohort() {
        let enroll_scores = vec![0.0, 2.0, 4.0]; // mean 2, std ~1.633
        let test_scores = vec![1.0, 3.0, 5.0]; // mean 3, std ~1.633
        let z = as_norm(5.0, &enroll_scores, &test_scores);
        let sigma = (8.0f64 / 3.0).sqrt();
        let expected = 0.5 * ((5.0 - 2.0) / sigma + (5.0 - 3.0) / sigma);
        assert!((z - expected).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn as_norm_is_symmetric(
            raw in -50.0f64..50.0,
            a in proptest::collection::vec(-20.0f64..20.0, 1..40),
            b in proptest::collection::vec(-20.0f64..20.0, 1..40),
        ) {
            let forward = as_norm(raw, &a, &b);
            let swapped = as_norm(raw, &b, &a);
            prop_assert!((forward - swapped).abs() < 1e-9);
        }
    }
}
