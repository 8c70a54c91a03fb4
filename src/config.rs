//! Engine configuration with environment overrides

use crate::error::{ContextError, Result};
use crate::types::{Category, Strategy, DEFAULT_MAX_TOKENS, DEFAULT_MODEL};
use std::collections::HashMap;
use std::time::Duration;

/// Share of the token budget given to each category
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetProportions {
    pub ancestors: f32,
    pub siblings: f32,
    pub references: f32,
    pub summaries: f32,
}

impl BudgetProportions {
    pub const fn new(ancestors: f32, siblings: f32, references: f32, summaries: f32) -> Self {
        Self { ancestors, siblings, references, summaries }
    }

    /// Everything goes to the ancestor chain (fallback builds)
    pub const ANCESTORS_ONLY: BudgetProportions = BudgetProportions::new(1.0, 0.0, 0.0, 0.0);

    pub fn share(&self, category: Category) -> f32 {
        match category {
            Category::Ancestor => self.ancestors,
            Category::Sibling => self.siblings,
            Category::Reference => self.references,
            Category::Summary => self.summaries,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let parts = [self.ancestors, self.siblings, self.references, self.summaries];
        if parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(ContextError::WeightingDegraded(format!(
                "invalid budget proportions: {:?}",
                self
            )));
        }
        let sum: f32 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(ContextError::WeightingDegraded(format!(
                "budget proportions sum to {:.3}",
                sum
            )));
        }
        Ok(())
    }
}

impl Default for BudgetProportions {
    fn default() -> Self {
        BudgetProportions::new(0.5, 0.2, 0.2, 0.1)
    }
}

fn default_budget_profiles() -> HashMap<Strategy, BudgetProportions> {
    Strategy::ALL
        .iter()
        .map(|s| {
            let p = match s {
                Strategy::Comprehensive => BudgetProportions::default(),
                Strategy::Focused => BudgetProportions::new(0.6, 0.1, 0.25, 0.05),
                Strategy::Exploratory => BudgetProportions::new(0.4, 0.35, 0.15, 0.1),
                Strategy::Creative => BudgetProportions::new(0.4, 0.35, 0.15, 0.1),
                Strategy::ReferenceHeavy => BudgetProportions::new(0.4, 0.1, 0.4, 0.1),
                Strategy::Analytical => BudgetProportions::new(0.5, 0.15, 0.3, 0.05),
                Strategy::Minimal => BudgetProportions::new(0.7, 0.0, 0.3, 0.0),
            };
            (*s, p)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_max_tokens: usize,
    pub default_model: String,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Token cap of the ancestor-only context used when a build degrades
    pub fallback_max_tokens: usize,
    /// Floor kept for the immediate parent when it must be truncated
    pub min_parent_tokens: usize,
    pub reallocation_cap: u32,
    pub recency_half_life: Duration,
    pub reference_boost: f32,
    pub budget_profiles: HashMap<Strategy, BudgetProportions>,
    pub node_store_url: Option<String>,
    pub remote_cache_url: Option<String>,
    pub cache_write_behind: bool,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: DEFAULT_MAX_TOKENS,
            default_model: DEFAULT_MODEL.to_string(),
            cache_ttl: Duration::from_secs(300),
            cache_capacity: 1024,
            fallback_max_tokens: 1000,
            min_parent_tokens: 64,
            reallocation_cap: 4,
            recency_half_life: Duration::from_secs(24 * 3600),
            reference_boost: 3.0,
            budget_profiles: default_budget_profiles(),
            node_store_url: None,
            remote_cache_url: None,
            cache_write_behind: false,
            port: 8081,
        }
    }
}

fn from_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Defaults overridden by `CANOPY_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_max_tokens: from_env("CANOPY_MAX_TOKENS", d.default_max_tokens),
            default_model: std::env::var("CANOPY_MODEL").unwrap_or(d.default_model),
            cache_ttl: Duration::from_secs(from_env("CANOPY_CACHE_TTL_SECS", d.cache_ttl.as_secs())),
            cache_capacity: from_env("CANOPY_CACHE_CAPACITY", d.cache_capacity).max(1),
            fallback_max_tokens: from_env("CANOPY_FALLBACK_MAX_TOKENS", d.fallback_max_tokens),
            min_parent_tokens: from_env("CANOPY_MIN_PARENT_TOKENS", d.min_parent_tokens),
            reallocation_cap: from_env("CANOPY_REALLOCATION_CAP", d.reallocation_cap),
            recency_half_life: Duration::from_secs(
                from_env("CANOPY_RECENCY_HALF_LIFE_SECS", d.recency_half_life.as_secs()).max(1),
            ),
            reference_boost: from_env("CANOPY_REFERENCE_BOOST", d.reference_boost).max(1.0),
            budget_profiles: d.budget_profiles,
            node_store_url: std::env::var("NODE_STORE_URL").ok(),
            remote_cache_url: std::env::var("REMOTE_CACHE_URL").ok(),
            cache_write_behind: from_env("CANOPY_CACHE_WRITE_BEHIND", d.cache_write_behind),
            port: from_env("CANOPY_PORT", d.port),
        }
    }

    pub fn proportions(&self, strategy: Strategy) -> BudgetProportions {
        self.budget_profiles
            .get(&strategy)
            .copied()
            .unwrap_or_default()
    }
}
