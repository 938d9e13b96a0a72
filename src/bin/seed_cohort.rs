//! Populate the background cohort collection.
//!
//! AS-Norm is only valid once the cohort collection holds enough vectors;
//! this tool runs the one-time seed, either from a file of pre-extracted
//! embeddings or from a directory of audio files.
//!
//! ```text
//! # From pre-extracted embeddings (raw little-endian f32 records):
//! seed_cohort --embeddings data/cohort_embeddings.f32
//!
//! # From audio files (slower, loads the encoder):
//! seed_cohort --audio-dir data/cohort_audio
//!
//! # Recreate the collection first:
//! seed_cohort --embeddings data/cohort_embeddings.f32 --force
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicegate::audio::AudioLoader;
use voicegate::config::Config;
use voicegate::embedding::{model_files, EcapaEmbedder};
use voicegate::qdrant::QdrantClient;
use voicegate::storage::CohortSeeder;

#[derive(Parser, Debug)]
#[command(name = "seed_cohort", about = "Seed the background-speaker cohort collection")]
struct Args {
    /// Qdrant host (defaults to QDRANT_HOST).
    #[arg(long, env = "QDRANT_HOST")]
    host: Option<String>,

    /// Qdrant port (defaults to QDRANT_PORT).
    #[arg(long, env = "QDRANT_PORT")]
    port: Option<u16>,

    /// Target collection (defaults to COHORT_COLLECTION).
    #[arg(long)]
    collection: Option<String>,

    /// File of raw little-endian f32 embedding records.
    #[arg(long, conflicts_with = "audio_dir")]
    embeddings: Option<PathBuf>,

    /// Directory of audio files to embed with the encoder.
    #[arg(long)]
    audio_dir: Option<PathBuf>,

    /// Maximum number of vectors to insert.
    #[arg(long)]
    max: Option<usize>,

    /// Embedding dimension when seeding from a raw file without loading
    /// the encoder.
    #[arg(long, default_value_t = 192)]
    dim: usize,

    /// Recreate the collection even when it already holds points.
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(host) = args.host {
        config.qdrant_host = host;
    }
    if let Some(port) = args.port {
        config.qdrant_port = port;
    }
    let collection = args
        .collection
        .unwrap_or_else(|| config.cohort_collection.clone());

    let qdrant = QdrantClient::new(&config.qdrant_url(), config.qdrant_timeout)
        .context("failed to build Qdrant client")?;
    info!("seeding collection '{}' at {}", collection, config.qdrant_url());

    let inserted = if let Some(audio_dir) = args.audio_dir {
        // Live extraction needs the encoder; its dimension wins.
        let ecapa_path =
            model_files::resolve_model(&config.ecapa_source, &config.ecapa_savedir).await?;
        let sample_rate = config.target_sample_rate;
        let embedder =
            tokio::task::spawn_blocking(move || EcapaEmbedder::load(&ecapa_path, sample_rate))
                .await?
                .context("failed to load ECAPA encoder")?;
        let embedder = Arc::new(embedder);

        let seeder = CohortSeeder::new(qdrant, collection.clone(), embedder.dim());
        let existing = seeder.prepare_collection(args.force).await?;
        if existing > 0 && !args.force {
            info!("collection already holds {} points; use --force to re-seed", existing);
            return Ok(());
        }
        let loader = AudioLoader::new(config.target_sample_rate);
        seeder
            .seed_from_audio_dir(&audio_dir, &loader, embedder, args.max)
            .await?
    } else if let Some(embeddings) = args.embeddings {
        let seeder = CohortSeeder::new(qdrant, collection.clone(), args.dim);
        let existing = seeder.prepare_collection(args.force).await?;
        if existing > 0 && !args.force {
            info!("collection already holds {} points; use --force to re-seed", existing);
            return Ok(());
        }
        seeder.seed_from_file(&embeddings, args.max).await?
    } else {
        anyhow::bail!("one of --embeddings or --audio-dir is required");
    };

    info!("done: {} vectors inserted into '{}'", inserted, collection);
    Ok(())
}
