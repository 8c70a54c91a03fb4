//! Core type definitions for branch-aware context assembly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub type NodeId = String;
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

/// What a node represents inside the tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Chat,
    Note, // annotation attached to a turn, never a chat exchange
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One turn (prompt + optional response) of a branching chat session.
/// Owned by the node store; read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub session_id: SessionId,
    pub prompt: String,
    pub response: Option<String>,
    pub status: NodeStatus,
    pub depth: u32,
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub response_tokens: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: NodeMetadata,
}

impl ConversationNode {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_note(&self) -> bool {
        self.metadata.kind == NodeKind::Note
    }

    /// Response text, if non-empty
    pub fn response_text(&self) -> Option<&str> {
        self.response.as_deref().filter(|r| !r.trim().is_empty())
    }

    /// Prompt and response joined, used for relevance scoring
    pub fn content(&self) -> String {
        match self.response_text() {
            Some(response) => format!("{}\n{}", self.prompt, response),
            None => self.prompt.clone(),
        }
    }
}

/// Source category of a candidate node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Ancestor,
    Sibling,
    Reference,
    Summary,
}

impl Category {
    /// Order in which categories receive reallocated budget
    pub const PRIORITY: [Category; 4] = [
        Category::Ancestor,
        Category::Reference,
        Category::Sibling,
        Category::Summary,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Comprehensive,
    Focused,
    Exploratory,
    ReferenceHeavy,
    Minimal,
    Analytical,
    Creative,
}

impl Strategy {
    pub const ALL: [Strategy; 7] = [
        Strategy::Comprehensive,
        Strategy::Focused,
        Strategy::Exploratory,
        Strategy::ReferenceHeavy,
        Strategy::Minimal,
        Strategy::Analytical,
        Strategy::Creative,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Comprehensive => "comprehensive",
            Strategy::Focused => "focused",
            Strategy::Exploratory => "exploratory",
            Strategy::ReferenceHeavy => "reference-heavy",
            Strategy::Minimal => "minimal",
            Strategy::Analytical => "analytical",
            Strategy::Creative => "creative",
        }
    }

    /// Priority dimension used when none is given explicitly
    pub fn default_priority(&self) -> Priority {
        match self {
            Strategy::Analytical => Priority::Completeness,
            Strategy::Exploratory | Strategy::Creative => Priority::Breadth,
            Strategy::ReferenceHeavy | Strategy::Focused | Strategy::Comprehensive => {
                Priority::Relevance
            }
            Strategy::Minimal => Priority::Recency,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Relevance,
    Recency,
    Completeness,
    Depth,
    Breadth,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Relevance => "relevance",
            Priority::Recency => "recency",
            Priority::Completeness => "completeness",
            Priority::Depth => "depth",
            Priority::Breadth => "breadth",
        };
        f.write_str(s)
    }
}

pub const DEFAULT_MAX_TOKENS: usize = 3000;
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Caller-supplied options for one build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextBuildOptions {
    pub strategy: Option<Strategy>,
    pub priority: Option<Priority>,
    pub max_tokens: usize,
    /// Sibling branches are off by default to prevent cross-branch leakage
    pub include_siblings: bool,
    pub include_notes: bool,
    pub include_references: Vec<NodeId>,
    pub model: String,
    pub use_cache: bool,
}

impl Default for ContextBuildOptions {
    fn default() -> Self {
        Self {
            strategy: None,
            priority: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            include_siblings: false,
            include_notes: true,
            include_references: vec![],
            model: DEFAULT_MODEL.to_string(),
            use_cache: true,
        }
    }
}

/// Per-candidate component scores, all in [0,1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ComponentScores {
    pub recency: f32,
    pub relevance: f32,
    pub completeness: f32,
    pub structural: f32,
    pub diversity: f32,
}

/// A node considered for inclusion in one build
#[derive(Debug, Clone)]
pub struct CandidateNode {
    pub node: ConversationNode,
    pub category: Category,
    /// Named by the user, either in the prompt or in the options
    pub explicit: bool,
    pub immediate_parent: bool,
    /// Tree distance to the target node
    pub distance: u32,
    pub scores: ComponentScores,
    /// Blended weight clamped to [0,1]
    pub raw_weight: f32,
    /// Weight after strategy adjustments; ranking key
    pub weight: f32,
    pub reason: String,
}

impl CandidateNode {
    pub fn new(node: ConversationNode, category: Category, distance: u32) -> Self {
        Self {
            node,
            category,
            explicit: false,
            immediate_parent: false,
            distance,
            scores: ComponentScores::default(),
            raw_weight: 0.0,
            weight: 0.0,
            reason: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            node_id: None,
            category: None,
        }
    }

    pub fn from_node(role: Role, content: impl Into<String>, node: &ConversationNode, category: Category) -> Self {
        Self {
            role,
            content: content.into(),
            node_id: Some(node.id.clone()),
            category: Some(category),
        }
    }
}

/// Ids of included nodes, per category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncludedNodes {
    pub ancestors: Vec<NodeId>,
    pub siblings: Vec<NodeId>,
    pub references: Vec<NodeId>,
    pub summaries: Vec<NodeId>,
}

impl IncludedNodes {
    pub fn push(&mut self, category: Category, id: NodeId) {
        match category {
            Category::Ancestor => self.ancestors.push(id),
            Category::Sibling => self.siblings.push(id),
            Category::Reference => self.references.push(id),
            Category::Summary => self.summaries.push(id),
        }
    }

    pub fn len(&self) -> usize {
        self.ancestors.len() + self.siblings.len() + self.references.len() + self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Build step that failed and forced the ancestor-only fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    ReferenceResolution,
    SiblingGathering,
    Weighting,
    Allocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExplanation {
    pub node_id: NodeId,
    pub category: Category,
    pub weight: f32,
    pub reason: String,
    pub included: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    pub strategy: Strategy,
    pub priority: Priority,
    pub total_tokens: usize,
    pub included: IncludedNodes,
    pub adaptive_adjustments: u32,
    pub degradation: Option<BuildStage>,
    pub explanations: Vec<NodeExplanation>,
}

/// Ordered messages to prepend before the model call, plus build metadata.
/// Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub metadata: BuildMetadata,
}

impl AssembledContext {
    pub fn messages_in(&self, category: Category) -> impl Iterator<Item = &ChatMessage> {
        self.messages
            .iter()
            .filter(move |m| m.category == Some(category))
    }
}

/// Result of [`crate::ContextAssembler::build_context`]
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub context: Arc<AssembledContext>,
    pub cache_hit: bool,
    /// Joined a build already in flight for the same key
    pub coalesced: bool,
    pub latency_ms: u64,
}

/// Stored assembly, valid while the session generation is unchanged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub context: Arc<AssembledContext>,
    pub session_id: SessionId,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_valid(&self, generation: u64, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        if self.generation != generation {
            return false;
        }
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.created_at + ttl > now,
            Err(_) => true,
        }
    }
}
