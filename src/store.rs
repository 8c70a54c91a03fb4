//! Read-only access to conversation nodes

use crate::error::{ContextError, Result};
use crate::types::{ConversationNode, NodeId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Trait for pluggable node stores
#[async_trait]
pub trait NodeStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_node(&self, id: &str) -> Result<Option<ConversationNode>>;

    async fn get_children(&self, id: &str) -> Result<Vec<ConversationNode>>;

    /// Root-to-target path, target included
    async fn get_ancestor_chain(&self, id: &str) -> Result<Vec<ConversationNode>> {
        walk_ancestor_chain(self, id).await
    }

    async fn list_session_nodes(&self, session_id: &str) -> Result<Vec<ConversationNode>>;
}

/// Follow parent links one read at a time. A cycle or dangling parent
/// ends the walk early rather than failing it.
pub async fn walk_ancestor_chain<S: NodeStore + ?Sized>(store: &S, id: &str) -> Result<Vec<ConversationNode>> {
    let mut chain = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut next = Some(id.to_string());

    while let Some(current) = next.take() {
        if !visited.insert(current.clone()) {
            warn!("Cycle in ancestor chain of {} at {}", id, current);
            break;
        }
        match store.get_node(&current).await? {
            Some(node) => {
                next = node.parent_id.clone();
                chain.push(node);
            }
            None if chain.is_empty() => return Err(ContextError::NodeNotFound(current)),
            None => {
                warn!("Dangling parent {} in chain of {}", current, id);
                break;
            }
        }
    }

    chain.reverse();
    Ok(chain)
}

/// Per-method read counters of [`InMemoryNodeStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub get_node: usize,
    pub get_children: usize,
    pub get_ancestor_chain: usize,
    pub list_session_nodes: usize,
}

/// In-process node store for tests and the demo server
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<NodeId, ConversationNode>>,
    get_node_calls: AtomicUsize,
    get_children_calls: AtomicUsize,
    ancestor_calls: AtomicUsize,
    session_calls: AtomicUsize,
}

impl InMemoryNodeStore {
    pub fn new(nodes: Vec<ConversationNode>) -> Self {
        let store = Self::default();
        for node in nodes {
            store.upsert(node);
        }
        store
    }

    /// Insert or replace a node. Callers must also invalidate the session's cached contexts.
    pub fn upsert(&self, node: ConversationNode) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub fn calls(&self) -> StoreCalls {
        StoreCalls {
            get_node: self.get_node_calls.load(Ordering::SeqCst),
            get_children: self.get_children_calls.load(Ordering::SeqCst),
            get_ancestor_chain: self.ancestor_calls.load(Ordering::SeqCst),
            list_session_nodes: self.session_calls.load(Ordering::SeqCst),
        }
    }

    fn sorted(mut nodes: Vec<ConversationNode>) -> Vec<ConversationNode> {
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        nodes
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn get_node(&self, id: &str) -> Result<Option<ConversationNode>> {
        self.get_node_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes.read().get(id).cloned())
    }

    async fn get_children(&self, id: &str) -> Result<Vec<ConversationNode>> {
        self.get_children_calls.fetch_add(1, Ordering::SeqCst);
        let children = self
            .nodes
            .read()
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(id))
            .cloned()
            .collect();
        Ok(Self::sorted(children))
    }

    async fn get_ancestor_chain(&self, id: &str) -> Result<Vec<ConversationNode>> {
        self.ancestor_calls.fetch_add(1, Ordering::SeqCst);
        let nodes = self.nodes.read();
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(id);
        while let Some(current) = next {
            if !visited.insert(current) {
                break;
            }
            let Some(node) = nodes.get(current) else {
                if chain.is_empty() {
                    return Err(ContextError::NodeNotFound(current.to_string()));
                }
                break;
            };
            chain.push(node.clone());
            next = node.parent_id.as_deref();
        }
        chain.reverse();
        Ok(chain)
    }

    async fn list_session_nodes(&self, session_id: &str) -> Result<Vec<ConversationNode>> {
        self.session_calls.fetch_add(1, Ordering::SeqCst);
        let nodes = self
            .nodes
            .read()
            .values()
            .filter(|n| n.session_id == session_id)
            .cloned()
            .collect();
        Ok(Self::sorted(nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeMetadata, NodeStatus};
    use chrono::Utc;

    fn node(id: &str, parent: Option<&str>, depth: u32) -> ConversationNode {
        ConversationNode {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            session_id: "s1".to_string(),
            prompt: format!("prompt {}", id),
            response: Some(format!("response {}", id)),
            status: NodeStatus::Completed,
            depth,
            prompt_tokens: 0,
            response_tokens: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: NodeMetadata::default(),
        }
    }

    /// Store that only implements the required methods, so the default chain walk is used
    struct Plain(InMemoryNodeStore);

    #[async_trait]
    impl NodeStore for Plain {
        fn name(&self) -> &'static str {
            "plain"
        }
        async fn get_node(&self, id: &str) -> Result<Option<ConversationNode>> {
            self.0.get_node(id).await
        }
        async fn get_children(&self, id: &str) -> Result<Vec<ConversationNode>> {
            self.0.get_children(id).await
        }
        async fn list_session_nodes(&self, session_id: &str) -> Result<Vec<ConversationNode>> {
            self.0.list_session_nodes(session_id).await
        }
    }

    #[tokio::test]
    async fn test_chain_root_to_target() {
        let store = InMemoryNodeStore::new(vec![
            node("root", None, 0),
            node("a", Some("root"), 1),
            node("b", Some("a"), 2),
        ]);
        let ids = |chain: Vec<ConversationNode>| chain.into_iter().map(|n| n.id).collect::<Vec<_>>();

        assert_eq!(ids(store.get_ancestor_chain("b").await.unwrap()), vec!["root", "a", "b"]);

        let plain = Plain(store);
        assert_eq!(ids(plain.get_ancestor_chain("b").await.unwrap()), vec!["root", "a", "b"]);
        assert_eq!(plain.0.calls().get_node, 3);
    }

    #[tokio::test]
    async fn test_chain_stops_on_cycle_and_dangling_parent() {
        let store = Plain(InMemoryNodeStore::new(vec![
            node("x", Some("y"), 1),
            node("y", Some("x"), 0),
            node("orphan", Some("gone"), 3),
        ]));
        assert_eq!(store.get_ancestor_chain("x").await.unwrap().len(), 2);
        assert_eq!(store.get_ancestor_chain("orphan").await.unwrap().len(), 1);
        assert!(matches!(
            store.get_ancestor_chain("missing").await,
            Err(ContextError::NodeNotFound(_))
        ));
    }
}
