//! Admin HTTP API.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /v1/cache/sequences/{id}
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::cache::block::{BlockId, StorageDomain};
use crate::cache::manager::{CacheStats, SequenceId, SharedCacheManager};
use crate::error::CacheError;
use crate::kernels::registry::{KernelInfo, KernelRegistry};
use crate::metrics::CacheMetrics;

/// Application state shared across handlers.
pub struct AppState {
    pub manager: SharedCacheManager,
    pub metrics: Arc<CacheMetrics>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/sequences/{id}", get(sequence_info))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub sequences: usize,
    pub device_free_blocks: usize,
    pub host_free_blocks: usize,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub cache: CacheStats,
    pub kernels: Vec<KernelInfo>,
}

#[derive(Debug, Serialize)]
pub struct SequenceInfo {
    pub sequence_id: SequenceId,
    pub residency: StorageDomain,
    pub num_tokens: usize,
    pub blocks: Vec<BlockId>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

/// Cache errors rendered as JSON with a matching status code.
pub struct ApiError(CacheError);

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CacheError::InvalidArgument(msg) if msg.starts_with("unknown sequence") => {
                StatusCode::NOT_FOUND
            }
            CacheError::InvalidArgument(_) | CacheError::OutOfRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            CacheError::OutOfMemory { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager = state.manager.read().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sequences: manager.sequence_ids().len(),
        device_free_blocks: manager.device().pool().free_count(),
        host_free_blocks: manager.host().pool().free_count(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let cache = state.manager.read().await.stats();
    Json(CacheStatsResponse {
        cache,
        kernels: KernelRegistry::global().snapshot(),
    })
}

async fn sequence_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<SequenceId>,
) -> Result<Json<SequenceInfo>, ApiError> {
    let manager = state.manager.read().await;
    let table = manager.block_table(id)?;
    Ok(Json(SequenceInfo {
        sequence_id: id,
        residency: manager.residency(id)?,
        num_tokens: table.len(),
        blocks: table.blocks().to_vec(),
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manager::new_shared_manager;
    use crate::config::{CacheConfig, EvictionConfig};

    async fn serve() -> (String, Arc<AppState>) {
        let metrics = Arc::new(CacheMetrics::new().unwrap());
        let config = CacheConfig {
            num_device_blocks: 8,
            num_host_blocks: 8,
            num_layers: 1,
            num_kv_heads: 2,
            head_dim: 16,
            ..CacheConfig::default()
        };
        let manager =
            new_shared_manager(&config, EvictionConfig::default(), metrics.clone()).unwrap();
        let state = Arc::new(AppState {
            manager,
            metrics,
            start_time: Instant::now(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn test_health() {
        let (base, _) = serve().await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["device_free_blocks"], 8);
    }

    #[tokio::test]
    async fn test_sequence_lookup() {
        let (base, state) = serve().await;
        let seq = {
            let mut m = state.manager.write().await;
            let seq = m.add_sequence();
            m.reserve(seq, 20).unwrap();
            seq
        };

        let resp = reqwest::get(format!("{base}/v1/cache/sequences/{seq}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["num_tokens"], 20);
        assert_eq!(body["blocks"].as_array().unwrap().len(), 2);
        assert_eq!(body["residency"], "device");

        let missing = reqwest::get(format!("{base}/v1/cache/sequences/999"))
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let (base, state) = serve().await;
        {
            let mut m = state.manager.write().await;
            let seq = m.add_sequence();
            m.reserve(seq, 4).unwrap();
        }

        let stats: serde_json::Value = reqwest::get(format!("{base}/v1/cache/stats"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["cache"]["device"]["allocated"], 1);
        assert_eq!(stats["cache"]["sequences"], 1);

        let text = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("blocks_allocated"));
    }
}
