//! Router setup and HTTP server lifecycle.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::handlers;
use crate::config::Config;
use crate::verifier::VoiceVerifier;

/// Uploads are short utterances; 50 MB leaves room for a full enrollment
/// batch of uncompressed WAV.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub verifier: Arc<VoiceVerifier>,
    pub config: Arc<Config>,
}

/// Build the versioned voiceprint router.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/v1/voiceprint/enroll", post(handlers::enroll))
        .route("/v1/voiceprint/verify", post(handlers::verify))
        .route("/v1/voiceprint/", delete(handlers::delete_voiceprint))
        .route(
            "/v1/voiceprint/verify/:customer_id/history",
            get(handlers::history),
        )
        .route("/v1/voiceprint/users", get(handlers::list_users))
        .route("/v1/voiceprint/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve until ctrl-c.
pub async fn run(ctx: AppContext) -> anyhow::Result<()> {
    let addr = ctx.config.bind_addr;
    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("voicegate listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
