/// HTTP key/value cache backend shared across engine instances
use crate::cache::CacheBackend;
use crate::error::{ContextError, Result};
use crate::types::CacheEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    value: u64,
}

#[derive(Debug, Default)]
struct PayloadStats {
    encoded_bytes: u64,
    raw_bytes: u64,
}

/// Stores entries as MessagePack blobs in a remote key/value service.
///
/// Expected routes: `GET|PUT {base}/kv/{key}`, `GET {base}/generations/{session}`,
/// `POST {base}/generations/{session}/incr`.
pub struct RemoteCacheBackend {
    base_url: String,
    client: reqwest::Client,
    payload: Mutex<PayloadStats>,
}

fn unavailable(e: impl std::fmt::Display) -> ContextError {
    ContextError::CacheUnavailable(e.to_string())
}

impl RemoteCacheBackend {
    /// Create a new remote cache client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            payload: Mutex::new(PayloadStats::default()),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, urlencoding::encode(key))
    }

    fn generation_url(&self, session_id: &str) -> String {
        format!("{}/generations/{}", self.base_url, urlencoding::encode(session_id))
    }

    /// MessagePack payload, recording its size against the JSON encoding
    fn encode(&self, entry: &CacheEntry) -> Result<Vec<u8>> {
        let encoded = rmp_serde::to_vec_named(entry).map_err(|e| ContextError::Serialization(e.to_string()))?;
        let raw = serde_json::to_vec(entry)?;

        let mut stats = self.payload.lock();
        stats.encoded_bytes += encoded.len() as u64;
        stats.raw_bytes += raw.len() as u64;
        Ok(encoded)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(unavailable(format!("Cache API error {}: {}", status, body)))
    }

    /// Health check
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl CacheBackend for RemoteCacheBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let url = self.kv_url(key);
        debug!("Fetching cache entry from {}", url);

        let response = self.client.get(&url).send().await.map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = Self::check(response).await?.bytes().await.map_err(unavailable)?;

        match rmp_serde::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Unreadable payloads (e.g. older format) are treated as misses
                debug!("Discarding undecodable cache entry {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let body = self.encode(&entry)?;
        let url = format!("{}?ttl={}", self.kv_url(key), ttl.as_secs().max(1));

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/msgpack")
            .body(body)
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn bump_generation(&self, session_id: &str) -> Result<u64> {
        let url = format!("{}/incr", self.generation_url(session_id));
        let response = self.client.post(&url).send().await.map_err(unavailable)?;
        let generation: GenerationResponse = Self::check(response).await?.json().await.map_err(unavailable)?;
        Ok(generation.value)
    }

    async fn get_generation(&self, session_id: &str) -> Result<u64> {
        let response = self
            .client
            .get(&self.generation_url(session_id))
            .send()
            .await
            .map_err(unavailable)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let generation: GenerationResponse = Self::check(response).await?.json().await.map_err(unavailable)?;
        Ok(generation.value)
    }

    fn compression_ratio(&self) -> Option<f64> {
        let stats = self.payload.lock();
        if stats.raw_bytes == 0 {
            None
        } else {
            Some(stats.encoded_bytes as f64 / stats.raw_bytes as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Utc;
    use std::sync::Arc;

    fn entry() -> CacheEntry {
        let context = AssembledContext {
            messages: vec![
                ChatMessage::new(Role::User, "How do I configure the scheduler?"),
                ChatMessage::new(Role::Assistant, "Set the worker count in the runtime builder."),
            ],
            metadata: BuildMetadata {
                strategy: Strategy::Focused,
                priority: Priority::Relevance,
                total_tokens: 21,
                included: IncludedNodes {
                    ancestors: vec!["node-1".into()],
                    ..Default::default()
                },
                adaptive_adjustments: 1,
                degradation: None,
                explanations: vec![],
            },
        };
        CacheEntry {
            context: Arc::new(context),
            session_id: "s1".into(),
            generation: 3,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_msgpack_payload_decodes_and_is_smaller() {
        let backend = RemoteCacheBackend::new("http://127.0.0.1:8095");
        assert!(backend.compression_ratio().is_none());

        let bytes = backend.encode(&entry()).unwrap();
        let decoded: CacheEntry = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.context.metadata.included.ancestors, vec!["node-1"]);

        let ratio = backend.compression_ratio().unwrap();
        assert!(ratio > 0.0 && ratio < 1.0, "{}", ratio);
    }

    #[tokio::test]
    #[ignore] // Requires running cache API
    async fn test_remote_cache_integration() {
        let backend = RemoteCacheBackend::new("http://127.0.0.1:8095");

        // Test health check
        let health = backend.health_check().await;
        assert!(health.is_ok());
    }
}
