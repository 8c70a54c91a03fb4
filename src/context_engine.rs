//! Core ContextAssembler: gathers, weights and budgets branch context for one turn

use crate::cache::{fingerprint, CacheLookup, CacheStats, ContextCache};
use crate::coalescer::{BuildCoalescer, CoalescerStats};
use crate::config::{BudgetProportions, EngineConfig};
use crate::error::{ContextError, Result};
use crate::references::{extract_references, resolve_references};
use crate::scoring::depth_closeness;
use crate::selection::{allocate, Allocation, AllocationPolicy};
use crate::store::NodeStore;
use crate::strategy::{resolve_plan, BuildPlan};
use crate::tokens::TokenCounter;
use crate::types::*;
use crate::weighting::{weight_candidates, WeightingContext};
use futures::future::{try_join_all, FutureExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const FALLBACK_REASON: &str = "ancestor fallback";

/// Result of one flight, shared by every coalesced caller
#[derive(Debug, Clone)]
struct Outcome {
    context: Arc<AssembledContext>,
    cache_hit: bool,
}

/// Everything a flight needs, owned so the flight can outlive its first caller
struct BuildRequest {
    key: String,
    node_id: NodeId,
    prompt: String,
    options: ContextBuildOptions,
    fragments: Vec<String>,
    plan: BuildPlan,
}

impl BuildRequest {
    fn has_references(&self) -> bool {
        !self.fragments.is_empty() || !self.options.include_references.is_empty()
    }
}

/// A recoverable failure, tagged with the step that produced it
type StageResult<T> = std::result::Result<T, (BuildStage, ContextError)>;

/// Main context assembler (thread-safe via Arc)
pub struct ContextAssembler {
    store: Arc<dyn NodeStore>,
    counter: Arc<dyn TokenCounter>,
    cache: Arc<ContextCache>,
    coalescer: BuildCoalescer<Result<Outcome>>,
    config: EngineConfig,
}

pub type SharedContextAssembler = Arc<ContextAssembler>;

impl ContextAssembler {
    pub fn new(
        store: Arc<dyn NodeStore>,
        counter: Arc<dyn TokenCounter>,
        cache: Arc<ContextCache>,
        config: EngineConfig,
    ) -> SharedContextAssembler {
        Arc::new(Self {
            store,
            counter,
            cache,
            coalescer: BuildCoalescer::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Main entry point: assemble the prior-turn context for a new prompt under `node_id`.
    ///
    /// Only a missing target node or a failed ancestor read is an error.
    /// Everything after that degrades to an ancestor-only context instead.
    pub async fn build_context(
        self: &Arc<Self>,
        node_id: &str,
        prompt: &str,
        options: ContextBuildOptions,
    ) -> Result<BuiltContext> {
        let start = Instant::now();
        let key = fingerprint(node_id, &options, prompt)?;

        let fragments = extract_references(prompt);
        let has_references = !fragments.is_empty() || !options.include_references.is_empty();
        let plan = resolve_plan(prompt, &options, has_references);
        debug!(
            "Build plan for {}: strategy={}, priority={}, references={:?}",
            node_id, plan.strategy, plan.priority, fragments
        );

        let request = BuildRequest {
            key: key.clone(),
            node_id: node_id.to_string(),
            prompt: prompt.to_string(),
            options,
            fragments,
            plan,
        };

        let assembler = Arc::clone(self);
        let (outcome, coalesced) = self
            .coalescer
            .run(&key, move || async move { assembler.run_build(request).await }.boxed())
            .await;
        let outcome = outcome?;

        Ok(BuiltContext {
            context: outcome.context,
            cache_hit: outcome.cache_hit,
            coalesced,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Bump the session's generation so every cached context for it reads as a miss.
    /// Call after any create/update/delete of a node in the session.
    pub async fn invalidate_session(&self, session_id: &str) -> Result<u64> {
        let generation = self.cache.invalidate_session(session_id).await?;
        info!("Invalidated session {} (generation {})", session_id, generation);
        Ok(generation)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn coalescer_stats(&self) -> CoalescerStats {
        self.coalescer.stats()
    }

    /// Wait for background cache writes before the process exits
    pub async fn shutdown(&self) {
        self.cache.flush().await;
    }

    /// Body of one flight: target, cache, ancestors, then assembly
    async fn run_build(&self, request: BuildRequest) -> Result<Outcome> {
        let started = Instant::now();

        let target = self
            .store
            .get_node(&request.node_id)
            .await?
            .ok_or_else(|| ContextError::NodeNotFound(request.node_id.clone()))?;

        let generation = if request.options.use_cache {
            match self.cache.lookup(&request.key, &target.session_id).await {
                CacheLookup::Hit(context) => {
                    debug!("Serving cached context for node {}", target.id);
                    return Ok(Outcome {
                        context,
                        cache_hit: true,
                    });
                }
                CacheLookup::Miss { generation } => Some(generation),
                CacheLookup::Unavailable => None,
            }
        } else {
            None
        };

        let ancestors: Vec<ConversationNode> = self
            .store
            .get_ancestor_chain(&target.id)
            .await?
            .into_iter()
            .filter(|n| n.id != target.id)
            .collect();

        let context = match self.assemble(&request, &target, &ancestors).await {
            Ok(context) => context,
            Err((stage, e)) => {
                warn!(
                    "Context build for {} degraded at {:?}: {}. Falling back to ancestors only.",
                    target.id, stage, e
                );
                self.fallback(&request, &ancestors, stage)?
            }
        };
        let context = Arc::new(context);
        self.cache.record_build(started.elapsed());

        // Degraded contexts are never cached, so the next call retries the full build
        if let (Some(generation), None) = (generation, context.metadata.degradation) {
            self.cache
                .store(&request.key, &target.session_id, generation, Arc::clone(&context))
                .await;
        }

        let meta = &context.metadata;
        info!(
            "Context built: node={}, strategy={}, priority={}, messages={}, tokens={}, adjustments={}, degraded={:?}, {}ms",
            target.id,
            meta.strategy,
            meta.priority,
            context.messages.len(),
            meta.total_tokens,
            meta.adaptive_adjustments,
            meta.degradation,
            started.elapsed().as_millis()
        );

        Ok(Outcome {
            context,
            cache_hit: false,
        })
    }

    async fn assemble(
        &self,
        request: &BuildRequest,
        target: &ConversationNode,
        ancestors: &[ConversationNode],
    ) -> StageResult<AssembledContext> {
        let options = &request.options;
        let mut candidates = ancestor_candidates(ancestors);

        if options.include_siblings || options.include_notes {
            let branches = self
                .gather_branches(target, ancestors, options)
                .await
                .map_err(|e| (BuildStage::SiblingGathering, e))?;
            candidates.extend(branches);
        }

        if request.has_references() {
            let referenced = self
                .resolve_referenced_nodes(request, target)
                .await
                .map_err(|e| (BuildStage::ReferenceResolution, e))?;
            merge_references(&mut candidates, referenced, target);
        }

        let ctx = WeightingContext {
            target,
            prompt: &request.prompt,
            plan: request.plan,
            config: &self.config,
        };
        let weighted = weight_candidates(candidates, &ctx).map_err(|e| (BuildStage::Weighting, e))?;

        let policy = AllocationPolicy {
            proportions: self.config.proportions(request.plan.strategy),
            min_parent_tokens: self.config.min_parent_tokens,
            reallocation_cap: self.config.reallocation_cap,
        };
        let model = self.model(options);
        let prompt_tokens = self.counter.count(&request.prompt, model);
        let budget = self.max_tokens(options).saturating_sub(prompt_tokens);

        let allocation = allocate(&weighted, budget, &policy, self.counter.as_ref(), model)
            .map_err(|e| (BuildStage::Allocation, e))?;

        Ok(finish(request, &weighted, allocation, prompt_tokens, None))
    }

    /// Ancestor-only context under the conservative fallback cap
    fn fallback(
        &self,
        request: &BuildRequest,
        ancestors: &[ConversationNode],
        stage: BuildStage,
    ) -> Result<AssembledContext> {
        let mut candidates = ancestor_candidates(ancestors);
        for cand in candidates.iter_mut() {
            cand.raw_weight = depth_closeness(cand.distance);
            cand.weight = cand.raw_weight;
            cand.reason = FALLBACK_REASON.to_string();
        }

        let policy = AllocationPolicy {
            proportions: BudgetProportions::ANCESTORS_ONLY,
            min_parent_tokens: self.config.min_parent_tokens,
            reallocation_cap: 0,
        };
        let model = self.model(&request.options);
        let prompt_tokens = self.counter.count(&request.prompt, model);
        let budget = self
            .max_tokens(&request.options)
            .min(self.config.fallback_max_tokens)
            .saturating_sub(prompt_tokens);

        let allocation = allocate(&candidates, budget, &policy, self.counter.as_ref(), model)?;
        Ok(finish(request, &candidates, allocation, prompt_tokens, Some(stage)))
    }

    /// Off-path children of every ancestor: chat turns become siblings, notes become summaries
    async fn gather_branches(
        &self,
        target: &ConversationNode,
        ancestors: &[ConversationNode],
        options: &ContextBuildOptions,
    ) -> Result<Vec<CandidateNode>> {
        let on_path: HashSet<&str> = ancestors
            .iter()
            .map(|n| n.id.as_str())
            .chain([target.id.as_str()])
            .collect();

        let children = try_join_all(ancestors.iter().map(|a| self.store.get_children(&a.id))).await?;

        let mut branches = Vec::new();
        for (i, kids) in children.into_iter().enumerate() {
            // Hops from the target up to the ancestor this branch leaves from
            let distance = (ancestors.len() - i) as u32;
            for child in kids {
                if on_path.contains(child.id.as_str()) || child.session_id != target.session_id {
                    continue;
                }
                let (category, wanted) = if child.is_note() {
                    (Category::Summary, options.include_notes)
                } else {
                    (Category::Sibling, options.include_siblings)
                };
                if wanted {
                    branches.push(CandidateNode::new(child, category, distance));
                }
            }
        }

        debug!("Gathered {} branch candidates for {}", branches.len(), target.id);
        Ok(branches)
    }

    /// Prompt fragments and explicit ids, resolved within the target's session
    async fn resolve_referenced_nodes(
        &self,
        request: &BuildRequest,
        target: &ConversationNode,
    ) -> Result<Vec<ConversationNode>> {
        let session_nodes = self.store.list_session_nodes(&target.session_id).await?;

        let mut ids = resolve_references(&request.fragments, &session_nodes);
        for id in &request.options.include_references {
            if ids.contains(id) {
                continue;
            }
            if session_nodes.iter().any(|n| &n.id == id) {
                ids.push(id.clone());
            } else {
                debug!("Dropping reference {} outside session {}", id, target.session_id);
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| session_nodes.iter().find(|n| &n.id == id).cloned())
            .collect())
    }

    fn model<'a>(&'a self, options: &'a ContextBuildOptions) -> &'a str {
        if options.model.is_empty() {
            &self.config.default_model
        } else {
            &options.model
        }
    }

    fn max_tokens(&self, options: &ContextBuildOptions) -> usize {
        if options.max_tokens == 0 {
            self.config.default_max_tokens
        } else {
            options.max_tokens
        }
    }
}

/// Root-to-parent chain as candidates; the last one is the immediate parent
fn ancestor_candidates(ancestors: &[ConversationNode]) -> Vec<CandidateNode> {
    let len = ancestors.len();
    ancestors
        .iter()
        .enumerate()
        .map(|(i, node)| {
            let mut cand = CandidateNode::new(node.clone(), Category::Ancestor, (len - i) as u32);
            cand.immediate_parent = i + 1 == len;
            cand
        })
        .collect()
}

/// Mark or add referenced nodes. An ancestor stays an ancestor; a sibling
/// or note that is also referenced moves to the reference category.
fn merge_references(
    candidates: &mut Vec<CandidateNode>,
    referenced: Vec<ConversationNode>,
    target: &ConversationNode,
) {
    for node in referenced {
        if node.id == target.id {
            continue;
        }
        match candidates.iter_mut().find(|c| c.node.id == node.id) {
            Some(existing) => {
                existing.explicit = true;
                if existing.category != Category::Ancestor {
                    existing.category = Category::Reference;
                }
            }
            None => {
                let distance = target.depth.abs_diff(node.depth).max(1);
                let mut cand = CandidateNode::new(node, Category::Reference, distance);
                cand.explicit = true;
                candidates.push(cand);
            }
        }
    }
}

/// Append the new user turn and attach metadata
fn finish(
    request: &BuildRequest,
    ranked: &[CandidateNode],
    allocation: Allocation,
    prompt_tokens: usize,
    degradation: Option<BuildStage>,
) -> AssembledContext {
    let included = allocation.included_ids();
    let explanations = ranked
        .iter()
        .map(|cand| NodeExplanation {
            node_id: cand.node.id.clone(),
            category: cand.category,
            weight: cand.weight,
            reason: cand.reason.clone(),
            included: included.contains(cand.node.id.as_str()),
        })
        .collect();

    let mut messages = allocation.messages;
    messages.push(ChatMessage::new(Role::User, request.prompt.clone()));

    AssembledContext {
        messages,
        metadata: BuildMetadata {
            strategy: request.plan.strategy,
            priority: request.plan.priority,
            total_tokens: allocation.total_tokens + prompt_tokens,
            included: allocation.included,
            adaptive_adjustments: allocation.adaptive_adjustments,
            degradation,
            explanations,
        },
    }
}
