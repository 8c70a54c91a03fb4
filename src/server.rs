//! HTTP server for Canopy context assembly

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::CacheStats;
use crate::coalescer::CoalescerStats;
use crate::warmup::{spawn_warmup, WarmupRequest};
use crate::{
    BuildMetadata, ChatMessage, ContextAssembler, ContextBuildOptions, ContextError,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContextRequest {
    pub node_id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: ContextBuildOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildContextResponse {
    pub messages: Vec<ChatMessage>,
    pub metadata: BuildMetadata,
    pub cache_hit: bool,
    pub coalesced: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct WarmRequest {
    pub requests: Vec<WarmupRequest>,
}

#[derive(Debug, Serialize)]
pub struct WarmResponse {
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
    pub session_id: String,
    pub generation: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub coalescer: CoalescerStats,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: ContextError) -> ApiError {
    let (status, label) = match &e {
        ContextError::NodeNotFound(_) => (StatusCode::NOT_FOUND, "Node not found"),
        ContextError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Node store unavailable"),
        ContextError::CacheUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Cache unavailable"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Context build failed"),
    };
    (
        status,
        Json(ErrorResponse {
            error: label.to_string(),
            details: Some(e.to_string()),
        }),
    )
}

/// Build context handler
async fn build_handler(
    State(assembler): State<Arc<ContextAssembler>>,
    Json(req): Json<BuildContextRequest>,
) -> Result<Json<BuildContextResponse>, ApiError> {
    info!("Received build request: node={}, maxTokens={}", req.node_id, req.options.max_tokens);

    match assembler.build_context(&req.node_id, &req.prompt, req.options).await {
        Ok(built) => Ok(Json(BuildContextResponse {
            messages: built.context.messages.clone(),
            metadata: built.context.metadata.clone(),
            cache_hit: built.cache_hit,
            coalesced: built.coalesced,
            latency_ms: built.latency_ms,
        })),
        Err(e) => {
            error!("Build failed for {}: {}", req.node_id, e);
            Err(api_error(e))
        }
    }
}

/// Warm-up handler: accepted immediately, built in the background
async fn warm_handler(
    State(assembler): State<Arc<ContextAssembler>>,
    Json(req): Json<WarmRequest>,
) -> (StatusCode, Json<WarmResponse>) {
    let accepted = req.requests.len();
    let mut handle = spawn_warmup(assembler, req.requests);

    tokio::spawn(async move {
        while let Some(failure) = handle.errors.recv().await {
            warn!("Warm-up failed for {}: {}", failure.key, failure.error);
        }
        handle.finish().await;
    });

    (StatusCode::ACCEPTED, Json(WarmResponse { accepted }))
}

async fn invalidate_handler(
    State(assembler): State<Arc<ContextAssembler>>,
    Path(session_id): Path<String>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let generation = assembler.invalidate_session(&session_id).await.map_err(api_error)?;
    Ok(Json(InvalidateResponse {
        session_id,
        generation,
    }))
}

async fn stats_handler(State(assembler): State<Arc<ContextAssembler>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cache: assembler.cache_stats(),
        coalescer: assembler.coalescer_stats(),
    })
}

/// Health check handler
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "canopy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Create and configure the HTTP server
pub fn create_router(assembler: Arc<ContextAssembler>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/context/build", post(build_handler))
        .route("/context/warm", post(warm_handler))
        .route("/sessions/:session_id/invalidate", post(invalidate_handler))
        .route("/cache/stats", get(stats_handler))
        .with_state(assembler)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

/// Run the HTTP server until Ctrl-C, then flush pending cache writes
pub async fn run_server(assembler: Arc<ContextAssembler>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting Canopy server on {}", addr);

    let app = create_router(Arc::clone(&assembler));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    assembler.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ContextCache, InMemoryCacheBackend};
    use crate::config::EngineConfig;
    use crate::store::InMemoryNodeStore;
    use crate::tokens::HeuristicTokenCounter;
    use crate::types::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn node(id: &str, parent: Option<&str>, depth: u32) -> ConversationNode {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, depth).unwrap();
        ConversationNode {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            session_id: "s1".to_string(),
            prompt: format!("question {}", id),
            response: Some(format!("answer {}", id)),
            status: NodeStatus::Completed,
            depth,
            prompt_tokens: 0,
            response_tokens: 0,
            created_at: at,
            updated_at: at,
            metadata: NodeMetadata::default(),
        }
    }

    async fn serve() -> String {
        let store = InMemoryNodeStore::new(vec![node("root", None, 0), node("leaf", Some("root"), 1)]);
        let cache = ContextCache::new(Arc::new(InMemoryCacheBackend::new(16)), Duration::from_secs(60));
        let assembler = ContextAssembler::new(
            Arc::new(store),
            Arc::new(HeuristicTokenCounter),
            Arc::new(cache),
            EngineConfig::default(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(assembler)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_build_and_invalidate_routes() {
        let base = serve().await;
        let client = reqwest::Client::new();

        let body = serde_json::json!({ "nodeId": "leaf", "prompt": "what next?" });
        let resp = client.post(format!("{}/context/build", base)).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["cacheHit"], false);
        assert_eq!(json["metadata"]["included"]["ancestors"], serde_json::json!(["root"]));

        let resp = client.post(format!("{}/context/build", base)).json(&body).send().await.unwrap();
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["cacheHit"], true);

        let resp = client.post(format!("{}/sessions/s1/invalidate", base)).send().await.unwrap();
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json, serde_json::json!({ "sessionId": "s1", "generation": 1 }));

        let stats: serde_json::Value = client
            .get(format!("{}/cache/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["cache"]["hits"], 1);
    }

    #[tokio::test]
    async fn test_missing_node_is_404() {
        let base = serve().await;
        let resp = reqwest::Client::new()
            .post(format!("{}/context/build", base))
            .json(&serde_json::json!({ "nodeId": "nope", "prompt": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["error"], "Node not found");
    }
}
