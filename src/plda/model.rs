//! PLDA model artifact.
//!
//! The model is trained offline and shipped as a JSON artifact holding the
//! global mean, the speaker factor loading matrix F (d_subspace columns),
//! the residual covariance Sigma, and a scaling factor. All parameters are
//! 64-bit floats and immutable for the process lifetime.

use std::path::Path;

use anyhow::{Context, Result};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

/// On-disk artifact layout. Matrices are row-major nested arrays.
#[derive(Debug, Deserialize)]
struct PldaArtifact {
    mean: Vec<f64>,
    f: Vec<Vec<f64>>,
    sigma: Vec<Vec<f64>>,
    #[serde(default = "default_scaling")]
    scaling_factor: f64,
}

fn default_scaling() -> f64 {
    1.0
}

/// PLDA parameters in linear-algebra form.
#[derive(Debug, Clone)]
pub struct PldaModel {
    pub mean: DVector<f64>,
    /// Speaker factor loading, `dim x subspace_dim`.
    pub f: DMatrix<f64>,
    /// Residual covariance, `dim x dim`.
    pub sigma: DMatrix<f64>,
    pub scaling_factor: f64,
}

impl PldaModel {
    /// Load and validate the JSON artifact.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read PLDA model {}", path.display()))?;
        let artifact: PldaArtifact = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse PLDA model {}", path.display()))?;
        Self::from_parts(artifact.mean, artifact.f, artifact.sigma, artifact.scaling_factor)
    }

    /// Build a model from raw rows, validating shapes.
    pub fn from_parts(
        mean: Vec<f64>,
        f_rows: Vec<Vec<f64>>,
        sigma_rows: Vec<Vec<f64>>,
        scaling_factor: f64,
    ) -> Result<Self> {
        let dim = mean.len();
        if dim == 0 {
            anyhow::bail!("PLDA mean is empty");
        }
        if f_rows.len() != dim {
            anyhow::bail!("PLDA F has {} rows, expected {}", f_rows.len(), dim);
        }
        let subspace = f_rows[0].len();
        if subspace == 0 || subspace > dim {
            anyhow::bail!("PLDA speaker subspace dimension {} out of range 1..={}", subspace, dim);
        }
        if f_rows.iter().any(|row| row.len() != subspace) {
            anyhow::bail!("PLDA F rows are ragged");
        }
        if sigma_rows.len() != dim || sigma_rows.iter().any(|row| row.len() != dim) {
            anyhow::bail!("PLDA Sigma must be {dim}x{dim}");
        }
        if !scaling_factor.is_finite() || scaling_factor <= 0.0 {
            anyhow::bail!("PLDA scaling factor must be positive, got {}", scaling_factor);
        }

        let f = DMatrix::from_fn(dim, subspace, |r, c| f_rows[r][c]);
        let sigma = DMatrix::from_fn(dim, dim, |r, c| sigma_rows[r][c]);
        Ok(Self {
            mean: DVector::from_vec(mean),
            f,
            sigma,
            scaling_factor,
        })
    }

    /// Embedding dimensionality the model expects.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}
