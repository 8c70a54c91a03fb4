//! Component scoring functions for candidate nodes

use crate::types::{ConversationNode, NodeStatus};
use std::collections::HashSet;
use std::time::Duration;

/// Lowercase, replace punctuation with spaces, split on whitespace
pub fn normalize_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Jaccard index of the normalized token sets of `a` and `b`.
///
/// Two empty inputs are identical (1.0); one empty input shares nothing (0.0).
pub fn relevance_score(a: &str, b: &str) -> f32 {
    let ta = normalize_tokens(a);
    let tb = normalize_tokens(b);
    jaccard(&ta, &tb)
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Exponential decay: 1.0 for age zero, 0.5 after one half-life
pub fn recency_score(age_secs: i64, half_life: Duration) -> f32 {
    let age = age_secs.max(0) as f64;
    let half_life = half_life.as_secs_f64().max(1.0);
    0.5f64.powf(age / half_life) as f32
}

pub fn completeness_score(node: &ConversationNode) -> f32 {
    let has_prompt = !node.prompt.trim().is_empty();
    let has_response = node.response_text().is_some();
    match node.status {
        NodeStatus::Failed => 0.1,
        NodeStatus::Completed if has_prompt && has_response => 1.0,
        _ if has_response => 0.6,
        _ if has_prompt => 0.3,
        _ => 0.0,
    }
}

/// 1.0 for the adjacent node, falling off with tree distance
pub fn depth_closeness(distance: u32) -> f32 {
    1.0 / (1.0 + distance.saturating_sub(1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard_conventions() {
        assert_eq!(relevance_score("", ""), 1.0);
        assert_eq!(relevance_score("", "hello"), 0.0);
        assert_eq!(relevance_score("hello", "  ...  "), 0.0);
        assert_eq!(relevance_score("Hello, World!", "world hello"), 1.0);
    }

    #[test]
    fn test_jaccard_partial_overlap() {
        // {rust, borrow, checker} vs {borrow, checker, errors}: 2 / 4
        let score = relevance_score("Rust borrow checker", "borrow-checker errors");
        assert!((score - 0.5).abs() < 1e-6, "{}", score);
    }

    #[test]
    fn test_recency_half_life() {
        let day = Duration::from_secs(86_400);
        assert_eq!(recency_score(0, day), 1.0);
        assert!((recency_score(86_400, day) - 0.5).abs() < 1e-6);
        assert_eq!(recency_score(-50, day), 1.0);
    }

    #[test]
    fn test_depth_closeness() {
        assert_eq!(depth_closeness(1), 1.0);
        assert_eq!(depth_closeness(2), 0.5);
        assert!(depth_closeness(5) < depth_closeness(3));
    }
}
