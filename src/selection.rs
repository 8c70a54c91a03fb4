//! Token budget allocation across candidate categories with adaptive reallocation

use crate::config::BudgetProportions;
use crate::error::Result;
use crate::tokens::{truncate_to_tokens, TokenCounter};
use crate::types::*;
use crate::weighting::compare_ranked;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct AllocationPolicy {
    pub proportions: BudgetProportions,
    pub min_parent_tokens: usize,
    pub reallocation_cap: u32,
}

/// Selected messages, in final order, and what it cost
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub messages: Vec<ChatMessage>,
    pub total_tokens: usize,
    pub included: IncludedNodes,
    pub adaptive_adjustments: u32,
    /// The immediate parent had to be cut to fit
    pub parent_truncated: bool,
}

impl Allocation {
    pub fn included_ids(&self) -> HashSet<&str> {
        let inc = &self.included;
        inc.ancestors
            .iter()
            .chain(&inc.siblings)
            .chain(&inc.references)
            .chain(&inc.summaries)
            .map(String::as_str)
            .collect()
    }
}

struct Rendered {
    messages: Vec<ChatMessage>,
    tokens: usize,
}

#[derive(Default)]
struct Lane {
    queue: Vec<usize>,
    cursor: usize,
    budget: usize,
    used: usize,
}

impl Lane {
    fn unused(&self) -> usize {
        self.budget.saturating_sub(self.used)
    }

    fn truncated(&self) -> bool {
        self.cursor < self.queue.len()
    }

    /// Take candidates in weight order until the next one would not fit
    fn fill(&mut self, rendered: &[Rendered]) {
        while let Some(&idx) = self.queue.get(self.cursor) {
            let cost = rendered[idx].tokens;
            if self.used + cost > self.budget {
                break;
            }
            self.used += cost;
            self.cursor += 1;
        }
    }

    fn next_cost(&self, rendered: &[Rendered]) -> Option<usize> {
        self.queue.get(self.cursor).map(|&idx| rendered[idx].tokens)
    }

    fn taken(&self) -> &[usize] {
        &self.queue[..self.cursor]
    }
}

/// Let the ancestor lane, first in [`Category::PRIORITY`], take back tokens
/// spent on lower-priority lanes.
///
/// Evicts the lowest-priority, lowest-weight picks first, and only while the
/// next ancestor can still be paid for. Returns the tokens freed.
fn reclaim_for_ancestors(lanes: &mut [Lane; 4], rendered: &[Rendered]) -> usize {
    let (head, lower) = lanes.split_at_mut(1);
    let ancestors = &mut head[0];
    let mut freed = 0;

    ancestors.fill(rendered);
    while let Some(cost) = ancestors.next_cost(rendered) {
        let reclaimable: usize = lower.iter().map(|l| l.used).sum();
        if cost > ancestors.unused() + reclaimable {
            break;
        }
        while ancestors.unused() < cost {
            let Some(lane) = lower.iter_mut().rev().find(|l| l.cursor > 0) else {
                break;
            };
            lane.cursor -= 1;
            let evicted = rendered[lane.queue[lane.cursor]].tokens;
            lane.used -= evicted;
            lane.budget = lane.used;
            ancestors.budget += evicted;
            freed += evicted;
        }
        ancestors.fill(rendered);
    }
    freed
}

fn lane_index(category: Category) -> usize {
    Category::PRIORITY
        .iter()
        .position(|c| *c == category)
        .unwrap_or(0)
}

fn short_id(id: &str) -> &str {
    let start = id.char_indices().rev().nth(7).map(|(i, _)| i).unwrap_or(0);
    &id[start..]
}

/// Render one candidate as chat messages
fn render(cand: &CandidateNode) -> Vec<ChatMessage> {
    let node = &cand.node;
    let category = cand.category;

    if category == Category::Summary || node.is_note() {
        let title = node
            .metadata
            .title
            .as_deref()
            .map(|t| format!(" ({})", t))
            .unwrap_or_default();
        let body = match node.response_text() {
            Some(r) => format!("{}\n{}", node.prompt, r),
            None => node.prompt.clone(),
        };
        return vec![ChatMessage::from_node(Role::System, format!("Note{}: {}", title, body), node, category)];
    }

    let user = match category {
        Category::Reference => format!("[Referenced conversation #{}]\n{}", short_id(&node.id), node.prompt),
        Category::Sibling => format!("[Parallel branch]\n{}", node.prompt),
        _ => node.prompt.clone(),
    };

    // Keep user/assistant turns paired even when the turn never got an answer
    let response = match node.response_text() {
        Some(response) => response.to_string(),
        None if node.status == NodeStatus::Failed => "(no response: generation failed)".to_string(),
        None => "(no response yet)".to_string(),
    };
    vec![
        ChatMessage::from_node(Role::User, user, node, category),
        ChatMessage::from_node(Role::Assistant, response, node, category),
    ]
}

fn count_messages(messages: &[ChatMessage], counter: &dyn TokenCounter, model: &str) -> usize {
    messages.iter().map(|m| counter.count(&m.content, model)).sum()
}

/// Cut the parent's messages down to `limit` tokens: response first, then prompt
fn fit_parent(
    mut messages: Vec<ChatMessage>,
    limit: usize,
    counter: &dyn TokenCounter,
    model: &str,
) -> Vec<ChatMessage> {
    if messages.len() == 1 {
        messages[0].content = truncate_to_tokens(counter, model, &messages[0].content, limit);
        return messages;
    }

    let head = counter.count(&messages[0].content, model);
    if head >= limit {
        messages[0].content = truncate_to_tokens(counter, model, &messages[0].content, limit / 2);
    }
    let head = counter.count(&messages[0].content, model);
    let last = messages.len() - 1;
    messages[last].content =
        truncate_to_tokens(counter, model, &messages[last].content, limit.saturating_sub(head));
    messages.retain(|m| !m.content.is_empty());
    messages
}

/// Select and order candidate messages within `budget` tokens.
///
/// The immediate parent is reserved first and never dropped; if it alone
/// exceeds the budget it is truncated, keeping at least `min_parent_tokens`.
/// The remainder is split across categories, filled greedily by weight, and
/// unused budget is moved to truncated categories for at most
/// `reallocation_cap` rounds. Ancestors outrank everything else: when the
/// pooled budget cannot fit the next ancestor, lower-priority picks are
/// evicted to make room.
pub fn allocate(
    candidates: &[CandidateNode],
    budget: usize,
    policy: &AllocationPolicy,
    counter: &dyn TokenCounter,
    model: &str,
) -> Result<Allocation> {
    policy.proportions.validate()?;

    let rendered: Vec<Rendered> = candidates
        .iter()
        .map(|cand| {
            let messages = render(cand);
            let tokens = count_messages(&messages, counter, model);
            Rendered { messages, tokens }
        })
        .collect();

    // Step 1: reserve the immediate parent
    let mut allocation = Allocation::default();
    let parent_idx = candidates.iter().position(|c| c.immediate_parent);
    let mut parent_messages = Vec::new();
    let mut parent_cost = 0;
    if let Some(idx) = parent_idx {
        let full = rendered[idx].tokens;
        if full <= budget {
            parent_messages = rendered[idx].messages.clone();
            parent_cost = full;
        } else {
            let limit = budget.max(policy.min_parent_tokens).min(full);
            parent_messages = fit_parent(rendered[idx].messages.clone(), limit, counter, model);
            parent_cost = count_messages(&parent_messages, counter, model);
            allocation.parent_truncated = parent_cost < full;
            debug!("Immediate parent truncated from {} to {} tokens", full, parent_cost);
        }
    }
    let remaining = budget.saturating_sub(parent_cost);

    // Step 2: split what is left across categories
    let mut lanes: [Lane; 4] = Default::default();
    for (lane, category) in lanes.iter_mut().zip(Category::PRIORITY) {
        lane.budget = (remaining as f32 * policy.proportions.share(category)).floor() as usize;
    }
    let assigned: usize = lanes.iter().map(|l| l.budget).sum();
    if assigned <= remaining {
        lanes[lane_index(Category::Ancestor)].budget += remaining - assigned;
    } else {
        // Proportions may sum slightly above 1 within tolerance
        let mut excess = assigned - remaining;
        for lane in lanes.iter_mut().rev() {
            let cut = excess.min(lane.budget);
            lane.budget -= cut;
            excess -= cut;
        }
    }

    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|&i| Some(i) != parent_idx && candidates[i].weight > 0.0)
        .collect();
    order.sort_by(|&a, &b| compare_ranked(&candidates[a], &candidates[b]));
    for idx in order {
        lanes[lane_index(candidates[idx].category)].queue.push(idx);
    }

    // Step 3: greedy fill, then adaptive reallocation
    for lane in lanes.iter_mut() {
        lane.fill(&rendered);
    }

    let ancestor_lane = lane_index(Category::Ancestor);
    for _ in 0..policy.reallocation_cap {
        let pool: usize = lanes.iter().map(Lane::unused).sum();
        let reclaimable: usize = lanes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ancestor_lane)
            .map(|(_, lane)| lane.used)
            .sum();
        let receiver = lanes.iter().enumerate().position(|(i, lane)| {
            let available = if i == ancestor_lane { pool + reclaimable } else { pool };
            lane.truncated() && lane.next_cost(&rendered).map_or(false, |cost| cost <= available)
        });
        let Some(receiver) = receiver else {
            break;
        };

        let mut moved = 0;
        for (i, lane) in lanes.iter_mut().enumerate() {
            if i != receiver && lane.unused() > 0 {
                moved += lane.unused();
                lane.budget = lane.used;
            }
        }
        lanes[receiver].budget += moved;

        if receiver == ancestor_lane {
            moved += reclaim_for_ancestors(&mut lanes, &rendered);
        } else {
            lanes[receiver].fill(&rendered);
        }
        if moved == 0 {
            break;
        }
        allocation.adaptive_adjustments += 1;
        debug!(
            "Reallocated {} tokens to {:?} (round {})",
            moved,
            Category::PRIORITY[receiver],
            allocation.adaptive_adjustments
        );
    }

    // Step 4: assemble in final order
    let taken = |category: Category| -> Vec<usize> { lanes[lane_index(category)].taken().to_vec() };

    let mut summaries = taken(Category::Summary);
    summaries.sort_by(|&a, &b| {
        let (na, nb) = (&candidates[a].node, &candidates[b].node);
        na.created_at.cmp(&nb.created_at).then_with(|| na.id.cmp(&nb.id))
    });
    for idx in summaries {
        allocation.messages.extend(rendered[idx].messages.iter().cloned());
        allocation.included.push(Category::Summary, candidates[idx].node.id.clone());
    }

    let mut ancestors = taken(Category::Ancestor);
    ancestors.extend(parent_idx);
    ancestors.sort_by_key(|&idx| candidates[idx].node.depth);
    for idx in ancestors {
        if Some(idx) == parent_idx {
            allocation.messages.extend(parent_messages.iter().cloned());
        } else {
            allocation.messages.extend(rendered[idx].messages.iter().cloned());
        }
        allocation.included.push(Category::Ancestor, candidates[idx].node.id.clone());
    }

    for idx in taken(Category::Reference) {
        allocation.messages.extend(rendered[idx].messages.iter().cloned());
        allocation.included.push(Category::Reference, candidates[idx].node.id.clone());
    }

    let mut siblings = taken(Category::Sibling);
    siblings.sort_by(|&a, &b| {
        let (na, nb) = (&candidates[a].node, &candidates[b].node);
        na.depth
            .cmp(&nb.depth)
            .then_with(|| na.created_at.cmp(&nb.created_at))
            .then_with(|| na.id.cmp(&nb.id))
    });
    for idx in siblings {
        allocation.messages.extend(rendered[idx].messages.iter().cloned());
        allocation.included.push(Category::Sibling, candidates[idx].node.id.clone());
    }

    allocation.total_tokens = parent_cost + lanes.iter().map(|l| l.used).sum::<usize>();
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    /// One token per whitespace-separated word
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str, _model: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    fn candidate(id: &str, category: Category, depth: u32, prompt_words: usize, response_words: usize, weight: f32) -> CandidateNode {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, depth).unwrap();
        let node = ConversationNode {
            id: id.to_string(),
            parent_id: None,
            session_id: "s1".to_string(),
            prompt: words(prompt_words),
            response: Some(words(response_words)),
            status: NodeStatus::Completed,
            depth,
            prompt_tokens: 0,
            response_tokens: 0,
            created_at: at,
            updated_at: at,
            metadata: NodeMetadata::default(),
        };
        let mut c = CandidateNode::new(node, category, 1);
        c.weight = weight;
        c.raw_weight = weight.min(1.0);
        c
    }

    fn policy() -> AllocationPolicy {
        AllocationPolicy {
            proportions: BudgetProportions::default(),
            min_parent_tokens: 8,
            reallocation_cap: 4,
        }
    }

    #[test]
    fn test_ancestors_kept_over_references() {
        // Chain needs 40 tokens, references 30, budget 49
        let mut parent = candidate("p", Category::Ancestor, 1, 10, 10, 0.9);
        parent.immediate_parent = true;
        let root = candidate("root", Category::Ancestor, 0, 10, 10, 0.5);
        let reference = candidate("r", Category::Reference, 1, 14, 15, 0.8);

        let alloc = allocate(&[parent, root, reference], 49, &policy(), &WordCounter, "m").unwrap();
        assert_eq!(alloc.included.ancestors, vec!["root", "p"]);
        assert!(alloc.included.references.is_empty());
        assert!(alloc.total_tokens <= 49);
        assert_eq!(alloc.total_tokens, 40);
        assert!(alloc.adaptive_adjustments >= 1);
    }

    #[test]
    fn test_reallocation_fills_unused_categories() {
        // No siblings or summaries: their shares must flow to ancestors
        let mut cands = vec![];
        for depth in 0..6u32 {
            cands.push(candidate(&format!("a{}", depth), Category::Ancestor, depth, 5, 5, 0.5));
        }
        let alloc = allocate(&cands, 60, &policy(), &WordCounter, "m").unwrap();
        assert_eq!(alloc.included.ancestors.len(), 6);
        assert_eq!(alloc.total_tokens, 60);
        assert!(alloc.adaptive_adjustments > 0);
    }

    #[test]
    fn test_budget_respected_without_parent() {
        let cands: Vec<CandidateNode> = (0..10)
            .map(|i| candidate(&format!("s{}", i), Category::Sibling, 2, 7, 6, 0.1 * i as f32))
            .collect();
        let alloc = allocate(&cands, 100, &policy(), &WordCounter, "m").unwrap();
        assert!(alloc.total_tokens <= 100);
        // Highest weight first
        assert!(alloc.included.siblings.contains(&"s9".to_string()));
    }

    #[test]
    fn test_oversized_parent_truncated_not_dropped() {
        let mut parent = candidate("p", Category::Ancestor, 3, 20, 200, 0.9);
        parent.immediate_parent = true;
        let alloc = allocate(&[parent], 30, &policy(), &WordCounter, "m").unwrap();
        assert_eq!(alloc.included.ancestors, vec!["p"]);
        assert!(alloc.parent_truncated);
        assert!(alloc.total_tokens <= 30, "{}", alloc.total_tokens);
        assert_eq!(alloc.messages.len(), 2);
        assert!(alloc.messages[1].content.ends_with('…'));
    }

    #[test]
    fn test_parent_kept_with_zero_budget() {
        let mut parent = candidate("p", Category::Ancestor, 3, 20, 20, 0.9);
        parent.immediate_parent = true;
        let alloc = allocate(&[parent], 0, &policy(), &WordCounter, "m").unwrap();
        assert_eq!(alloc.included.ancestors, vec!["p"]);
        assert!(alloc.total_tokens <= 8);
        assert!(!alloc.messages.is_empty());
    }

    #[test]
    fn test_zero_weight_skipped_and_order() {
        let mut parent = candidate("p", Category::Ancestor, 2, 2, 2, 0.9);
        parent.immediate_parent = true;
        let dropped = candidate("root", Category::Ancestor, 0, 2, 2, 0.0);
        let mid = candidate("mid", Category::Ancestor, 1, 2, 2, 0.4);
        let sib = candidate("sib", Category::Sibling, 2, 2, 2, 0.4);
        let reference = candidate("ref", Category::Reference, 1, 2, 2, 0.4);

        let alloc = allocate(&[sib, parent, reference, dropped, mid], 1000, &policy(), &WordCounter, "m").unwrap();
        let order: Vec<&str> = alloc
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .filter_map(|m| m.node_id.as_deref())
            .collect();
        assert_eq!(order, vec!["mid", "p", "ref", "sib"]);
    }

    #[test]
    fn test_invalid_proportions_error() {
        let bad = AllocationPolicy {
            proportions: BudgetProportions::new(0.5, 0.5, 0.5, 0.0),
            ..policy()
        };
        assert!(allocate(&[], 10, &bad, &WordCounter, "m").is_err());
    }

    #[test]
    fn test_ancestors_evict_several_small_references() {
        // Chain needs 40 tokens, three 10-token references, 45 available
        let mut parent = candidate("p", Category::Ancestor, 1, 10, 10, 0.9);
        parent.immediate_parent = true;
        let root = candidate("root", Category::Ancestor, 0, 10, 10, 0.5);
        let mut cands = vec![parent, root];
        for i in 0..3 {
            cands.push(candidate(&format!("r{}", i), Category::Reference, 1, 5, 5, 2.0));
        }
        let policy = AllocationPolicy {
            proportions: BudgetProportions::new(0.4, 0.1, 0.4, 0.1),
            ..policy()
        };

        let alloc = allocate(&cands, 45, &policy, &WordCounter, "m").unwrap();
        assert_eq!(alloc.included.ancestors, vec!["root", "p"]);
        assert!(alloc.included.references.is_empty());
        assert_eq!(alloc.total_tokens, 40);
        assert_eq!(alloc.adaptive_adjustments, 1);
    }

    #[test]
    fn test_reallocation_stops_at_cap() {
        // Two receivers in turn: ancestors first, then siblings with the leftover
        let cands = vec![
            candidate("a0", Category::Ancestor, 0, 15, 15, 0.6),
            candidate("a1", Category::Ancestor, 1, 15, 15, 0.5),
            candidate("s0", Category::Sibling, 2, 7, 8, 0.4),
            candidate("s1", Category::Sibling, 2, 7, 8, 0.3),
        ];

        let capped = AllocationPolicy {
            reallocation_cap: 1,
            ..policy()
        };
        let alloc = allocate(&cands, 100, &capped, &WordCounter, "m").unwrap();
        assert_eq!(alloc.adaptive_adjustments, 1);
        assert_eq!(alloc.included.ancestors, vec!["a0", "a1"]);
        assert_eq!(alloc.included.siblings, vec!["s0"]);
        assert_eq!(alloc.total_tokens, 75);

        let alloc = allocate(&cands, 100, &policy(), &WordCounter, "m").unwrap();
        assert_eq!(alloc.adaptive_adjustments, 2);
        assert_eq!(alloc.included.siblings, vec!["s0", "s1"]);
        assert_eq!(alloc.total_tokens, 90);
    }

    #[test]
    fn test_unanswered_ancestor_keeps_turns_paired() {
        let mut parent = candidate("p", Category::Ancestor, 2, 3, 3, 0.9);
        parent.immediate_parent = true;
        let mut failed = candidate("mid", Category::Ancestor, 1, 3, 0, 0.5);
        failed.node.response = None;
        failed.node.status = NodeStatus::Failed;

        let alloc = allocate(&[parent, failed], 100, &policy(), &WordCounter, "m").unwrap();
        let roles: Vec<Role> = alloc.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(alloc.messages[1].content, "(no response: generation failed)");
    }
}
