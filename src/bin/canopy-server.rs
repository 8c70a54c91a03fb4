//! Canopy HTTP server binary

use canopy::cache::{CacheBackend, ContextCache, InMemoryCacheBackend};
use canopy::remote_cache::RemoteCacheBackend;
use canopy::server::run_server;
use canopy::store::{InMemoryNodeStore, NodeStore};
use canopy::store_client::HttpNodeStore;
use canopy::{
    ContextAssembler, ConversationNode, EngineConfig, HeuristicTokenCounter, NodeKind, NodeMetadata,
    NodeStatus,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    info!("Canopy context assembler v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();

    let store: Arc<dyn NodeStore> = match &config.node_store_url {
        Some(url) => {
            let store = HttpNodeStore::new(url.clone());
            match store.health_check().await {
                Ok(true) => info!("Node store is healthy: {}", url),
                Ok(false) => warn!("Node store at {} reported unhealthy", url),
                Err(e) => warn!("Node store at {} unreachable: {}", url, e),
            }
            Arc::new(store)
        }
        None => {
            info!("No NODE_STORE_URL set; serving the in-memory demo session");
            Arc::new(InMemoryNodeStore::new(demo_nodes()))
        }
    };

    let backend: Arc<dyn CacheBackend> = match &config.remote_cache_url {
        Some(url) => {
            info!("Remote cache enabled: {}", url);
            Arc::new(RemoteCacheBackend::new(url.clone()))
        }
        None => Arc::new(InMemoryCacheBackend::new(config.cache_capacity)),
    };

    let cache = ContextCache::new(backend, config.cache_ttl);
    let cache = if config.cache_write_behind {
        let (cache, mut errors) = cache.with_write_behind();
        tokio::spawn(async move {
            while let Some(failure) = errors.recv().await {
                warn!("Background cache write failed for {}: {}", failure.key, failure.error);
            }
        });
        cache
    } else {
        cache
    };

    let port = config.port;
    let assembler = ContextAssembler::new(
        store,
        Arc::new(HeuristicTokenCounter),
        Arc::new(cache),
        config,
    );

    info!("Context assembler initialized");
    run_server(assembler, port).await?;

    Ok(())
}

/// Small branching session: one root question, two answers branching from it, and a note
fn demo_nodes() -> Vec<ConversationNode> {
    let now = Utc::now();
    let node = |id: &str, parent: Option<&str>, depth: u32, minutes_ago: i64, prompt: &str, response: &str| {
        let at = now - Duration::minutes(minutes_ago);
        ConversationNode {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            session_id: "demo".to_string(),
            prompt: prompt.to_string(),
            response: Some(response.to_string()),
            status: NodeStatus::Completed,
            depth,
            prompt_tokens: 0,
            response_tokens: 0,
            created_at: at,
            updated_at: at,
            metadata: NodeMetadata::default(),
        }
    };

    let mut note = node(
        "demo-note-0001",
        Some("demo-root-0001"),
        1,
        25,
        "Team prefers managed services over self-hosting.",
        "",
    );
    note.metadata = NodeMetadata {
        kind: NodeKind::Note,
        title: Some("constraints".to_string()),
    };

    vec![
        node(
            "demo-root-0001",
            None,
            0,
            30,
            "We need a message queue for order events. What are the options?",
            "Common choices are Kafka, RabbitMQ, NATS and a managed cloud queue.",
        ),
        node(
            "demo-kafka-0002",
            Some("demo-root-0001"),
            1,
            20,
            "Tell me more about Kafka for this.",
            "Kafka gives durable, replayable partitions with high throughput.",
        ),
        node(
            "demo-nats-0003",
            Some("demo-root-0001"),
            1,
            15,
            "And NATS?",
            "NATS is lightweight; JetStream adds persistence and replay.",
        ),
        node(
            "demo-kafka-0004",
            Some("demo-kafka-0002"),
            2,
            5,
            "How would we partition order events?",
            "Key by order id so every event of one order lands on the same partition.",
        ),
        note,
    ]
}
