//! One-time cohort seeding.
//!
//! AS-Norm needs a large background-speaker cohort in the vector store. The
//! seeder populates it offline, either from a file of pre-extracted
//! embeddings (raw little-endian f32 records, `dim` floats each) or by
//! running the encoder over a directory of audio files. Request-time code
//! only ever reads the cohort.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tokio::task;
use tracing::{info, warn};

use crate::audio::AudioLoader;
use crate::embedding::{l2_normalize, EcapaEmbedder};
use crate::error::{Error, Result};
use crate::qdrant::QdrantClient;

/// Upserts per Qdrant call.
const BATCH_SIZE: usize = 100;

/// Populates the background cohort collection.
pub struct CohortSeeder {
    qdrant: QdrantClient,
    collection: String,
    dim: usize,
}

impl CohortSeeder {
    pub fn new(qdrant: QdrantClient, collection: impl Into<String>, dim: usize) -> Self {
        Self {
            qdrant,
            collection: collection.into(),
            dim,
        }
    }

    /// Recreate the collection when `force` is set or the dimension is
    /// wrong; otherwise leave existing points alone. Returns the number of
    /// points already present.
    pub async fn prepare_collection(&self, force: bool) -> Result<u64> {
        if force {
            match self.qdrant.delete_collection(&self.collection).await {
                Ok(()) => info!("recreating collection '{}'", self.collection),
                Err(e) => warn!("could not delete '{}': {}", self.collection, e),
            }
        }
        self.qdrant.ensure_collection(&self.collection, self.dim).await?;
        self.qdrant.count(&self.collection).await
    }

    /// Seed from a raw embeddings file: consecutive little-endian f32
    /// records of `dim` floats each. Returns the number inserted.
    pub async fn seed_from_file(&self, path: &Path, max_vectors: Option<usize>) -> Result<usize> {
        info!("loading cohort embeddings from {}", path.display());
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::internal(format!("failed to read {}: {}", path.display(), e)))?;

        let record_bytes = self.dim * 4;
        if bytes.is_empty() || bytes.len() % record_bytes != 0 {
            return Err(Error::internal(format!(
                "{} holds {} bytes, not a multiple of {} ({}-d f32 records)",
                path.display(),
                bytes.len(),
                record_bytes,
                self.dim
            )));
        }

        let mut embeddings: Vec<Vec<f32>> = bytes
            .chunks_exact(record_bytes)
            .map(|record| {
                record
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            })
            .collect();
        if let Some(max) = max_vectors {
            embeddings.truncate(max);
        }
        info!("parsed {} cohort embeddings", embeddings.len());

        for embedding in embeddings.iter_mut() {
            l2_normalize(embedding);
        }

        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.upsert_all(&embeddings, &source, 0).await?;
        Ok(embeddings.len())
    }

    /// Seed by extracting embeddings from every decodable audio file in a
    /// directory. Slow; intended for small curated cohorts.
    pub async fn seed_from_audio_dir(
        &self,
        dir: &Path,
        loader: &AudioLoader,
        embedder: Arc<EcapaEmbedder>,
        max_files: Option<usize>,
    ) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::internal(format!("failed to read {}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::internal(format!("failed to list {}: {}", dir.display(), e)))?
        {
            if entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false)
            {
                paths.push(entry.path());
            }
        }
        paths.sort();
        if let Some(max) = max_files {
            paths.truncate(max);
        }

        let mut embeddings = Vec::new();
        let mut errors = 0usize;
        for path in &paths {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| Error::internal(format!("failed to read {}: {}", path.display(), e)))?;
            let hint = path.to_string_lossy().into_owned();
            let loader = loader.clone();
            let embedder = Arc::clone(&embedder);
            let result = task::spawn_blocking(move || -> Result<Vec<f32>> {
                let samples = loader.load(&bytes, Some(&hint))?;
                embedder.extract(&samples)
            })
            .await?;

            match result {
                Ok(embedding) => embeddings.push(embedding),
                Err(e) => {
                    errors += 1;
                    warn!("skipping {}: {}", path.display(), e);
                }
            }
        }
        if errors > 0 {
            warn!("{} of {} files failed to embed", errors, paths.len());
        }

        let source = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        self.upsert_all(&embeddings, &source, 0).await?;
        Ok(embeddings.len())
    }

    async fn upsert_all(&self, embeddings: &[Vec<f32>], source: &str, id_offset: u64) -> Result<()> {
        let total = embeddings.len();
        let mut inserted = 0usize;
        for (batch_idx, batch) in embeddings.chunks(BATCH_SIZE).enumerate() {
            let base = id_offset + (batch_idx * BATCH_SIZE) as u64;
            let points: Vec<(u64, &[f32], serde_json::Value)> = batch
                .iter()
                .enumerate()
                .map(|(i, embedding)| {
                    let index = base + i as u64;
                    (
                        index,
                        embedding.as_slice(),
                        json!({ "source": source, "index": index }),
                    )
                })
                .collect();
            self.qdrant.upsert_batch(&self.collection, &points).await?;
            inserted += batch.len();
            if inserted % 500 == 0 || inserted == total {
                info!("{}/{} cohort vectors inserted", inserted, total);
            }
        }
        Ok(())
    }
}
