//! Canopy - branch-aware context assembly for tree-structured chat
//!
//! Builds the prior-turn message list for a new prompt on a conversation tree:
//! - Ancestor chain, optional sibling branches, notes and explicit references
//! - Strategy inference and weighted ranking of candidate turns
//! - Proportional token budgets with adaptive reallocation
//! - Generation-invalidated caching and request coalescing

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod references;
pub mod remote_cache;
pub mod scoring;
pub mod selection;
pub mod server;
pub mod store;
pub mod store_client; // HTTP node store
pub mod strategy;
pub mod tokens;
pub mod types;
pub mod warmup;
pub mod weighting;

pub use types::*;
pub use cache::{CacheBackend, ContextCache, InMemoryCacheBackend};
pub use config::{BudgetProportions, EngineConfig};
pub use context_engine::{ContextAssembler, SharedContextAssembler};
pub use error::{ContextError, Result};
pub use remote_cache::RemoteCacheBackend;
pub use store::{InMemoryNodeStore, NodeStore};
pub use store_client::HttpNodeStore;
pub use tokens::{HeuristicTokenCounter, TokenCounter};
pub use warmup::{spawn_warmup, WarmupReport, WarmupRequest};
