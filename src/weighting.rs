//! Node weighting: blends component scores into one ranking weight per candidate

use crate::config::EngineConfig;
use crate::error::{ContextError, Result};
use crate::scoring::{completeness_score, depth_closeness, jaccard, normalize_tokens, recency_score};
use crate::strategy::BuildPlan;
use crate::types::*;
use std::cmp::Ordering;
use std::collections::HashSet;

const PRIMARY_COEF: f32 = 0.7;
const SECONDARY_COEF: f32 = 0.1;
const EXPLICIT_BONUS: f32 = 0.15;
const DIVERSITY_BONUS: f32 = 0.2;

/// Inputs shared by every candidate of one build
pub struct WeightingContext<'a> {
    pub target: &'a ConversationNode,
    pub prompt: &'a str,
    pub plan: BuildPlan,
    pub config: &'a EngineConfig,
}

/// Score, adjust and rank candidates.
///
/// Output is sorted by weight (desc), then tree distance, creation time and id,
/// so identical inputs always rank identically.
pub fn weight_candidates(
    mut candidates: Vec<CandidateNode>,
    ctx: &WeightingContext<'_>,
) -> Result<Vec<CandidateNode>> {
    if candidates.is_empty() {
        return Ok(candidates);
    }

    // Age is measured against the newest timestamp in the snapshot rather
    // than the wall clock, so repeated builds score identically.
    let reference_time = candidates
        .iter()
        .map(|c| c.node.updated_at)
        .chain([ctx.target.updated_at, ctx.target.created_at])
        .max()
        .unwrap_or(ctx.target.updated_at);

    let prompt_tokens = normalize_tokens(ctx.prompt);
    let content_tokens: Vec<HashSet<String>> = candidates
        .iter()
        .map(|c| normalize_tokens(&c.node.content()))
        .collect();

    for (cand, tokens) in candidates.iter_mut().zip(&content_tokens) {
        let age = (reference_time - cand.node.updated_at).num_seconds();
        cand.scores.recency = recency_score(age, ctx.config.recency_half_life);
        cand.scores.relevance = jaccard(tokens, &prompt_tokens);
        cand.scores.completeness = completeness_score(&cand.node);
        cand.scores.structural = depth_closeness(cand.distance);
    }

    compute_diversity(&mut candidates, &content_tokens);

    for cand in candidates.iter_mut() {
        apply_weight(cand, ctx);
        if !cand.weight.is_finite() || !cand.raw_weight.is_finite() {
            return Err(ContextError::WeightingDegraded(format!(
                "non-finite weight for node {}",
                cand.node.id
            )));
        }
        cand.reason = explain(cand, ctx.plan.strategy);
    }

    candidates.sort_by(compare_ranked);
    Ok(candidates)
}

/// Diversity = 1 - max similarity to candidates of the same category ranked
/// before it (pre-ranked by relevance). The first of each category is fully diverse.
fn compute_diversity(candidates: &mut [CandidateNode], content_tokens: &[HashSet<String>]) {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        let (ca, cb) = (&candidates[a], &candidates[b]);
        cb.scores
            .relevance
            .total_cmp(&ca.scores.relevance)
            .then_with(|| ca.node.created_at.cmp(&cb.node.created_at))
            .then_with(|| ca.node.id.cmp(&cb.node.id))
    });

    let mut seen: Vec<(Category, usize)> = Vec::new();
    for idx in order {
        let category = candidates[idx].category;
        let max_sim = seen
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, prev)| jaccard(&content_tokens[idx], &content_tokens[*prev]))
            .fold(0.0f32, f32::max);
        candidates[idx].scores.diversity = 1.0 - max_sim;
        seen.push((category, idx));
    }
}

fn apply_weight(cand: &mut CandidateNode, ctx: &WeightingContext<'_>) {
    let s = &mut cand.scores;
    if ctx.plan.priority == Priority::Breadth {
        s.structural = 0.5 * s.structural + 0.5 * s.diversity;
    }

    let components = [s.recency, s.relevance, s.completeness, s.structural];
    let primary_idx = match ctx.plan.priority {
        Priority::Recency => 0,
        Priority::Relevance => 1,
        Priority::Completeness => 2,
        Priority::Depth | Priority::Breadth => 3,
    };
    let secondary: f32 = components
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary_idx)
        .map(|(_, v)| v)
        .sum();

    let mut raw = PRIMARY_COEF * components[primary_idx] + SECONDARY_COEF * secondary;
    if cand.explicit {
        raw += EXPLICIT_BONUS;
    }
    cand.raw_weight = raw.clamp(0.0, 1.0);

    let mut weight = cand.raw_weight;
    match ctx.plan.strategy {
        Strategy::ReferenceHeavy if cand.explicit => {
            // Lifted above the unboosted [0,1] range so references always outrank
            weight = 1.0 + weight * ctx.config.reference_boost;
        }
        Strategy::Minimal if !(cand.immediate_parent || cand.explicit) => {
            weight = 0.0;
        }
        Strategy::Exploratory | Strategy::Creative
            if matches!(cand.category, Category::Sibling | Category::Summary) =>
        {
            weight += DIVERSITY_BONUS * cand.scores.diversity;
        }
        _ => {}
    }
    cand.weight = weight;
}

fn explain(cand: &CandidateNode, strategy: Strategy) -> String {
    if cand.weight <= 0.0 && strategy == Strategy::Minimal {
        return "suppressed by minimal strategy".to_string();
    }

    let mut labels = Vec::new();
    if cand.immediate_parent {
        labels.push("immediate parent");
    }
    if cand.scores.relevance >= 0.5 {
        labels.push("high relevance");
    }
    if cand.scores.recency >= 0.75 {
        labels.push("recent");
    }
    if cand.scores.completeness >= 1.0 {
        labels.push("complete");
    }
    if depth_closeness(cand.distance) >= 0.5 {
        labels.push("close in tree");
    }
    if matches!(cand.category, Category::Sibling | Category::Summary) && cand.scores.diversity >= 0.75 {
        labels.push("diverse");
    }
    if cand.explicit {
        labels.push("explicit reference");
        if strategy == Strategy::ReferenceHeavy {
            labels.push("reference boost");
        }
    }

    if labels.is_empty() {
        "baseline".to_string()
    } else {
        labels.join(" + ")
    }
}

pub fn compare_ranked(a: &CandidateNode, b: &CandidateNode) -> Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| a.distance.cmp(&b.distance))
        .then_with(|| a.node.created_at.cmp(&b.node.created_at))
        .then_with(|| a.node.id.cmp(&b.node.id))
}
