//! Global metrics registries and the scrape/liveness HTTP endpoint.

use {
    axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get},
    prometheus::{Encoder, Registry, TextEncoder},
    prometheus_metric_storage::StorageRegistry,
    std::{net::SocketAddr, sync::Arc, sync::LazyLock},
};

static REGISTRY: LazyLock<StorageRegistry> =
    LazyLock::new(|| StorageRegistry::new(Registry::new()));

pub fn get_metrics_registry() -> &'static Registry {
    REGISTRY.registry()
}

pub fn get_metric_storage_registry() -> &'static StorageRegistry {
    &REGISTRY
}

#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

#[derive(Clone)]
struct AppState {
    liveness: Arc<dyn LivenessChecking>,
}

/// Serves `/metrics` and `/liveness` until the process exits.
pub async fn serve_metrics(
    liveness: Arc<dyn LivenessChecking>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/liveness", get(liveness_handler))
        .with_state(AppState { liveness });
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(?addr, "serving metrics");
    axum::serve(listener, app).await
}

async fn metrics() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&get_metrics_registry().gather(), &mut buffer) {
        tracing::error!(?err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    }
    (StatusCode::OK, buffer)
}

async fn liveness_handler(State(state): State<AppState>) -> StatusCode {
    if state.liveness.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
