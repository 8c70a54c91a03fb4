//! Model-aware token counting

/// Counts tokens for a given model. Must be deterministic per model id.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str, model: &str) -> usize;
}

/// Character-ratio approximation of common tokenizers
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl HeuristicTokenCounter {
    fn chars_per_token(model: &str) -> f32 {
        let model = model.to_ascii_lowercase();
        if model.starts_with("claude") {
            3.5
        } else if model.contains("llama") || model.contains("mistral") || model.contains("qwen") {
            3.2
        } else if model.starts_with("gpt-3.5") || model == "gpt-4" || model.starts_with("gpt-4-") {
            3.8
        } else {
            4.0
        }
    }
}

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str, model: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        (chars as f32 / Self::chars_per_token(model)).ceil() as usize
    }
}

const ELLIPSIS: &str = "…";

/// Cut `text` so it counts at most `limit` tokens, marking the cut with an ellipsis.
pub fn truncate_to_tokens(counter: &dyn TokenCounter, model: &str, text: &str, limit: usize) -> String {
    if counter.count(text, model) <= limit {
        return text.to_string();
    }
    if limit == 0 {
        return String::new();
    }

    // Binary search the longest char prefix that fits with the marker appended
    // boundaries[k] is the byte offset where the k-char prefix ends
    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    if boundaries.is_empty() {
        return String::new();
    }
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        let candidate = format!("{}{}", &text[..boundaries[mid]], ELLIPSIS);
        if counter.count(&candidate, model) <= limit {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    if lo == 0 {
        return if counter.count(ELLIPSIS, model) <= limit {
            ELLIPSIS.to_string()
        } else {
            String::new()
        };
    }
    format!("{}{}", text[..boundaries[lo]].trim_end(), ELLIPSIS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counts_are_model_aware() {
        let counter = HeuristicTokenCounter;
        let text = "a".repeat(40);
        assert_eq!(counter.count(&text, "gpt-4o"), 10);
        assert_eq!(counter.count(&text, "claude-3-5-sonnet"), 12);
        assert_eq!(counter.count("", "gpt-4o"), 0);
    }

    #[test]
    fn test_truncate_respects_limit() {
        let counter = HeuristicTokenCounter;
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let cut = truncate_to_tokens(&counter, "gpt-4o", &text, 25);
        assert!(counter.count(&cut, "gpt-4o") <= 25);
        assert!(cut.ends_with('…'));
        assert!(cut.len() > 40, "should keep a useful prefix: {:?}", cut);
    }

    #[test]
    fn test_truncate_short_text_untouched() {
        let counter = HeuristicTokenCounter;
        assert_eq!(truncate_to_tokens(&counter, "gpt-4o", "hello", 10), "hello");
    }
}
