//! Explicit node mentions (`@id` / `#id`) in prompts

use crate::types::{ConversationNode, NodeId};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::debug;

/// Sigil at start of input or after whitespace / opening punctuation,
/// so `user@example.com` is not a reference.
static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s(\[{"',;:])[@#]([A-Za-z0-9][A-Za-z0-9_-]{3,63})"#)
        .expect("REFERENCE_RE regex should compile")
});

/// Id fragments mentioned in `prompt`, lowercased, deduplicated, in order of appearance
pub fn extract_references(prompt: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    REFERENCE_RE
        .captures_iter(prompt)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim_end_matches(['-', '_']).to_lowercase())
        .filter(|frag| frag.len() >= 4 && seen.insert(frag.clone()))
        .collect()
}

/// Match fragments against known node ids: exact first, then unique suffix.
///
/// Unmatched and ambiguous fragments are dropped; a garbled mention must
/// never abort a build.
pub fn resolve_references(fragments: &[String], known: &[ConversationNode]) -> Vec<NodeId> {
    let mut resolved: Vec<NodeId> = Vec::new();

    for fragment in fragments {
        let fragment = fragment.to_lowercase();

        let exact = known.iter().find(|n| n.id.to_lowercase() == fragment);
        let id = match exact {
            Some(node) => Some(node.id.clone()),
            None => {
                let mut matches = known
                    .iter()
                    .filter(|n| n.id.to_lowercase().ends_with(&fragment));
                match (matches.next(), matches.next()) {
                    (Some(node), None) => Some(node.id.clone()),
                    (Some(_), Some(_)) => {
                        debug!("Ambiguous reference '{}' dropped", fragment);
                        None
                    }
                    _ => {
                        debug!("Unresolved reference '{}' dropped", fragment);
                        None
                    }
                }
            }
        };

        if let Some(id) = id {
            if !resolved.contains(&id) {
                resolved.push(id);
            }
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeMetadata, NodeStatus};
    use chrono::Utc;

    fn node(id: &str) -> ConversationNode {
        ConversationNode {
            id: id.to_string(),
            parent_id: None,
            session_id: "s1".to_string(),
            prompt: String::new(),
            response: None,
            status: NodeStatus::Completed,
            depth: 0,
            prompt_tokens: 0,
            response_tokens: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: NodeMetadata::default(),
        }
    }

    #[test]
    fn test_extract_order_and_dedup() {
        let refs = extract_references("Compare @a1b2c3d4 with #FFEE9900 and again @A1B2C3D4.");
        assert_eq!(refs, vec!["a1b2c3d4", "ffee9900"]);
    }

    #[test]
    fn test_extract_ignores_emails_and_short_tags() {
        assert!(extract_references("mail me at dev@example.com").is_empty());
        assert!(extract_references("see issue #12").is_empty());
        assert_eq!(extract_references("(#abcd-) done"), vec!["abcd"]);
    }

    #[test]
    fn test_resolve_suffix_exact_and_ambiguous() {
        let known = vec![
            node("0000-1111-a1b2c3d4"),
            node("9999-2222-deadbeef"),
            node("7777-3333-deadbeef"),
            node("cafe"),
        ];
        let fragments = vec![
            "a1b2c3d4".to_string(),
            "deadbeef".to_string(), // two suffix matches
            "cafe".to_string(),
            "nothing1".to_string(),
        ];
        let resolved = resolve_references(&fragments, &known);
        assert_eq!(resolved, vec!["0000-1111-a1b2c3d4".to_string(), "cafe".to_string()]);
    }
}
