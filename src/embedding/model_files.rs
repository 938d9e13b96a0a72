//! Model artifact resolution.
//!
//! `ECAPA_SOURCE` may be a local filesystem path or an http(s) URL. URLs are
//! downloaded once into `ECAPA_SAVEDIR` and reused on subsequent startups.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Resolve `source` to a local model path, downloading if necessary.
pub async fn resolve_model(source: &str, savedir: &Path) -> Result<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        download_if_missing(source, savedir).await
    } else {
        let path = PathBuf::from(source);
        if !path.exists() {
            anyhow::bail!("model file not found: {}", path.display());
        }
        Ok(path)
    }
}

/// Cache filename for a model URL: its final path segment.
fn cached_name(url: &str) -> &str {
    url.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("model.onnx")
}

async fn download_if_missing(url: &str, savedir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(savedir)
        .await
        .with_context(|| format!("failed to create model cache dir {}", savedir.display()))?;

    let target = savedir.join(cached_name(url));
    if target.exists() {
        debug!("model already cached at {}", target.display());
        return Ok(target);
    }

    info!("downloading model from {} to {}", url, target.display());
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("failed to fetch model from {}", url))?
        .error_for_status()
        .with_context(|| format!("model download from {} failed", url))?;

    // Stream into a sibling temp path, renaming only after success, so a
    // killed download never leaves a truncated model behind.
    let partial = target.with_extension("partial");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("model download stream failed")?;
        file.write_all(&chunk).await.context("failed to write model chunk")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("failed to flush model file")?;
    drop(file);

    tokio::fs::rename(&partial, &target)
        .await
        .with_context(|| format!("failed to move model into place at {}", target.display()))?;

    info!("model downloaded ({} bytes)", written);
    Ok(target)
}
