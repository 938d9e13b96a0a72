//! ECAPA-TDNN speaker embedding extraction via ONNX Runtime.
//!
//! One session is created at startup and shared read-only across the
//! process; `extract` is safe to call concurrently. Inference is CPU-bound
//! and expected to run on the bounded worker pool, never directly on the
//! async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use ndarray::Array3;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::{debug, info};

use crate::embedding::fbank::{cmvn, compute_fbank, FbankConfig};
use crate::embedding::l2_normalize;
use crate::error::Error;

/// Speaker encoder wrapping an ECAPA-TDNN ONNX model.
///
/// Input contract: mono float32 at the configured sample rate, at least one
/// second long. Output: a fixed-dimension L2-normalized embedding.
pub struct EcapaEmbedder {
    session: Arc<Mutex<Session>>,
    fbank_cfg: FbankConfig,
    dim: usize,
    min_samples: usize,
}

impl EcapaEmbedder {
    /// Load the encoder and probe its output dimension.
    ///
    /// Blocking: call from a worker thread during startup.
    pub fn load(model_path: &Path, sample_rate: u32) -> Result<Self> {
        info!("loading ECAPA encoder from {}", model_path.display());

        let session = Session::builder()
            .context("failed to create ONNX session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("failed to set graph optimization level")?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load ONNX model {}", model_path.display()))?;
        let session = Arc::new(Mutex::new(session));

        let fbank_cfg = FbankConfig {
            sample_rate,
            ..FbankConfig::default()
        };

        // Probe with silence to discover the embedding dimension; the
        // vector-store configuration is validated against it at startup.
        let probe_frames = 200usize;
        let probe = ndarray::Array3::<f32>::zeros((1, probe_frames, fbank_cfg.num_bins));
        let dim = run_session(&session, probe)?.len();
        info!("ECAPA encoder ready, embedding dimension {}", dim);

        Ok(Self {
            session,
            fbank_cfg,
            dim,
            min_samples: sample_rate as usize,
        })
    }

    /// Embedding dimensionality, exposed so callers can validate store
    /// configuration.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Minimum accepted clip length, in samples.
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Extract one L2-normalized embedding from a mono clip.
    pub fn extract(&self, samples: &[f32]) -> crate::error::Result<Vec<f32>> {
        if samples.len() < self.min_samples {
            return Err(Error::bad_audio(format!(
                "audio too short for embedding: {} samples, need at least {}",
                samples.len(),
                self.min_samples
            )));
        }

        let mut features = compute_fbank(samples, &self.fbank_cfg)
            .ok_or_else(|| Error::bad_audio("audio too short for feature extraction"))?;
        cmvn(&mut features);

        let (num_frames, num_bins) = features.dim();
        debug!("running encoder on {} frames x {} bins", num_frames, num_bins);
        let input = features
            .into_shape((1, num_frames, num_bins))
            .map_err(|e| Error::internal(format!("feature reshape failed: {}", e)))?;

        let mut embedding = run_session(&self.session, input)
            .map_err(|e| Error::internal(format!("encoder inference failed: {:#}", e)))?;

        if embedding.len() != self.dim {
            return Err(Error::internal(format!(
                "encoder returned {} values, expected {}",
                embedding.len(),
                self.dim
            )));
        }

        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

/// Run the encoder on a `[1, frames, bins]` feature tensor and flatten the
/// output.
fn run_session(session: &Mutex<Session>, features: Array3<f32>) -> Result<Vec<f32>> {
    let input = TensorRef::from_array_view(&features).context("failed to build input tensor")?;
    let mut session = session.lock().expect("ONNX session mutex poisoned");
    let outputs = session.run(ort::inputs![input]).context("encoder forward pass failed")?;
    let (_shape, data) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("encoder produced no outputs"))?
        .1
        .try_extract_tensor::<f32>()
        .context("failed to extract embedding tensor")?;
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Session-backed tests require a real model file and run only when
    // ECAPA_SOURCE points at one; everything numeric around the session is
    // covered by the fbank and normalization tests.
    #[test]
    fn load_probes_dimension_when_model_available() {
        let Ok(source) = std::env::var("ECAPA_SOURCE") else {
            return;
        };
        let path = std::path::PathBuf::from(source);
        if !path.exists() {
            return;
        }
        let embedder = EcapaEmbedder::load(&path, 16_000).unwrap();
        assert!(embedder.dim() > 0);

        let clip = vec![0.01f32; 32_000];
        let embedding = embedder.extract(&clip).unwrap();
        assert_eq!(embedding.len(), embedder.dim());
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
