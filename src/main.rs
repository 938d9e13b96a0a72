//! Service entry point: load models, connect stores, serve HTTP.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voicegate::api::server::{self, AppContext};
use voicegate::config::Config;
use voicegate::embedding::{model_files, EcapaEmbedder};
use voicegate::plda::{PldaModel, PldaScorer};
use voicegate::qdrant::QdrantClient;
use voicegate::storage::{Database, VoiceprintStore};
use voicegate::verifier::VoiceVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().context("invalid configuration")?);
    info!(
        "starting voicegate (enabled: {}, qdrant: {})",
        config.voiceprint_enabled,
        config.qdrant_url()
    );

    // Models load once and are shared read-only for the process lifetime.
    let ecapa_path = model_files::resolve_model(&config.ecapa_source, &config.ecapa_savedir)
        .await
        .context("failed to resolve ECAPA model")?;
    let sample_rate = config.target_sample_rate;
    let embedder = tokio::task::spawn_blocking(move || EcapaEmbedder::load(&ecapa_path, sample_rate))
        .await?
        .context("failed to load ECAPA encoder")?;
    let embedder = Arc::new(embedder);

    let plda_path = config.plda_model_path.clone();
    let scorer = tokio::task::spawn_blocking(move || -> Result<PldaScorer> {
        let model = PldaModel::load(&plda_path)?;
        PldaScorer::new(&model)
    })
    .await?
    .context("failed to load PLDA model")?;
    let scorer = Arc::new(scorer);

    let qdrant = QdrantClient::new(&config.qdrant_url(), config.qdrant_timeout)
        .context("failed to build Qdrant client")?;

    let db = Database::new(&config.database_path)
        .await
        .context("failed to open database")?;
    db.migrate().await.context("failed to migrate database")?;
    let store = VoiceprintStore::new(db);

    let verifier = VoiceVerifier::new(
        Arc::clone(&config),
        embedder,
        scorer,
        qdrant,
        store,
    );
    if let Err(e) = verifier.init_collections().await {
        // The service can still start; requests will surface store errors
        // until Qdrant comes back.
        warn!("vector collection init failed: {}", e);
    }

    let ctx = AppContext {
        verifier: Arc::new(verifier),
        config,
    };
    server::run(ctx).await?;

    info!("voicegate stopped");
    Ok(())
}
