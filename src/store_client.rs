/// HTTP client for a remote node store API
use crate::error::{ContextError, Result};
use crate::store::NodeStore;
use crate::types::ConversationNode;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpNodeStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpNodeStore {
    /// Create a new node store client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn node_url(&self, id: &str, suffix: &str) -> String {
        format!("{}/nodes/{}{}", self.base_url, urlencoding::encode(id), suffix)
    }

    /// GET `url`, mapping 404 to `None`
    async fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        debug!("Fetching {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ContextError::StoreUnavailable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ContextError::StoreUnavailable(format!(
                "Node store error {}: {}",
                status, body
            )));
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|e| ContextError::StoreUnavailable(format!("invalid node store payload: {}", e)))?;
        Ok(Some(body))
    }

    /// Health check
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ContextError::StoreUnavailable(e.to_string()))?;
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl NodeStore for HttpNodeStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get_node(&self, id: &str) -> Result<Option<ConversationNode>> {
        self.fetch(&self.node_url(id, "")).await
    }

    async fn get_children(&self, id: &str) -> Result<Vec<ConversationNode>> {
        let children: Option<Vec<ConversationNode>> = self.fetch(&self.node_url(id, "/children")).await?;
        Ok(children.unwrap_or_default())
    }

    async fn get_ancestor_chain(&self, id: &str) -> Result<Vec<ConversationNode>> {
        let chain: Option<Vec<ConversationNode>> = self.fetch(&self.node_url(id, "/ancestors")).await?;
        match chain {
            Some(chain) if !chain.is_empty() => {
                debug!("Retrieved {} ancestors for node {}", chain.len(), id);
                Ok(chain)
            }
            _ => Err(ContextError::NodeNotFound(id.to_string())),
        }
    }

    async fn list_session_nodes(&self, session_id: &str) -> Result<Vec<ConversationNode>> {
        let url = format!(
            "{}/sessions/{}/nodes",
            self.base_url,
            urlencoding::encode(session_id)
        );
        let nodes: Option<Vec<ConversationNode>> = self.fetch(&url).await?;
        Ok(nodes.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_encoded() {
        let store = HttpNodeStore::new("http://127.0.0.1:8090/");
        assert_eq!(
            store.node_url("a b/c", "/children"),
            "http://127.0.0.1:8090/nodes/a%20b%2Fc/children"
        );
    }

    #[tokio::test]
    #[ignore] // Requires running node store API
    async fn test_node_store_integration() {
        let store = HttpNodeStore::new("http://127.0.0.1:8090");

        // Test health check
        let health = store.health_check().await;
        assert!(health.is_ok());
    }
}
