//! Strategy and priority inference from prompt text.
//!
//! Rules live in an ordered table; the first matching predicate wins.

use crate::types::{ContextBuildOptions, Priority, Strategy};

/// Pre-computed view of a prompt that rule predicates read from
#[derive(Debug, Clone)]
pub struct PromptSignals {
    pub words: Vec<String>,
    pub normalized: String,
    pub has_references: bool,
}

impl PromptSignals {
    pub fn new(prompt: &str, has_references: bool) -> Self {
        let words: Vec<String> = prompt
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let normalized = words.join(" ");
        Self { words, normalized, has_references }
    }

    /// Any word starting with one of `stems`
    fn any_word(&self, stems: &[&str]) -> bool {
        self.words
            .iter()
            .any(|w| stems.iter().any(|s| w.starts_with(s)))
    }

    /// Exact word match, for short keywords a prefix would over-match
    fn any_exact(&self, words: &[&str]) -> bool {
        self.words.iter().any(|w| words.contains(&w.as_str()))
    }

    fn any_phrase(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|p| self.normalized.contains(p))
    }
}

pub struct StrategyRule {
    pub name: &'static str,
    pub matches: fn(&PromptSignals) -> bool,
    pub strategy: Strategy,
}

const FOCUSED_MAX_WORDS: usize = 15;

fn has_references(s: &PromptSignals) -> bool {
    s.has_references
}

fn is_comparison(s: &PromptSignals) -> bool {
    s.any_word(&["compar", "versus", "contrast"])
        || s.any_exact(&["vs"])
        || s.any_phrase(&["difference between", "differences between"])
}

fn is_ideation(s: &PromptSignals) -> bool {
    s.any_word(&["brainstorm", "idea", "alternative"])
}

fn is_creative(s: &PromptSignals) -> bool {
    s.any_word(&["design", "creativ", "imagin"]) || s.any_exact(&["story", "stories"])
}

fn is_direct_question(s: &PromptSignals) -> bool {
    if s.has_references || s.words.is_empty() || s.words.len() > FOCUSED_MAX_WORDS {
        return false;
    }
    const OPENERS: [&str; 8] = ["how", "what", "why", "where", "when", "which", "can", "fix"];
    OPENERS.contains(&s.words[0].as_str()) || s.any_phrase(&["how to", "how do"])
}

/// Ordered inference table. Explicit references come first: they are
/// unambiguous user intent, so they beat comparison keywords.
pub static STRATEGY_RULES: &[StrategyRule] = &[
    StrategyRule { name: "explicit-references", matches: has_references, strategy: Strategy::ReferenceHeavy },
    StrategyRule { name: "comparison", matches: is_comparison, strategy: Strategy::Analytical },
    StrategyRule { name: "ideation", matches: is_ideation, strategy: Strategy::Exploratory },
    StrategyRule { name: "creative", matches: is_creative, strategy: Strategy::Creative },
    StrategyRule { name: "direct-question", matches: is_direct_question, strategy: Strategy::Focused },
];

/// Infer a strategy from prompt text. `Minimal` is never inferred.
pub fn infer_strategy(prompt: &str, has_references: bool) -> Strategy {
    let signals = PromptSignals::new(prompt, has_references);
    STRATEGY_RULES
        .iter()
        .find(|rule| (rule.matches)(&signals))
        .map(|rule| rule.strategy)
        .unwrap_or(Strategy::Comprehensive)
}

/// Strategy and priority after applying explicit overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildPlan {
    pub strategy: Strategy,
    pub priority: Priority,
}

pub fn resolve_plan(prompt: &str, options: &ContextBuildOptions, has_references: bool) -> BuildPlan {
    let strategy = options
        .strategy
        .unwrap_or_else(|| infer_strategy(prompt, has_references));
    let priority = options
        .priority
        .unwrap_or_else(|| strategy.default_priority());
    BuildPlan { strategy, priority }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table_order() {
        assert_eq!(infer_strategy("Compare @a1b2c3d4 with the previous answer", true), Strategy::ReferenceHeavy);
        assert_eq!(infer_strategy("Compare this with the previous answer", false), Strategy::Analytical);
        assert_eq!(infer_strategy("What's the difference between them?", false), Strategy::Analytical);
        assert_eq!(infer_strategy("Brainstorm some ideas for the launch", false), Strategy::Exploratory);
        assert_eq!(infer_strategy("Write a story about a lighthouse keeper", false), Strategy::Creative);
        assert_eq!(infer_strategy("How do I reset the counter?", false), Strategy::Focused);
        assert_eq!(
            infer_strategy("Please summarize everything we discussed so far about the deployment plan", false),
            Strategy::Comprehensive
        );
    }

    #[test]
    fn test_focused_requires_short_prompt() {
        let long = "how would you restructure the whole ingestion pipeline given all of the constraints we listed earlier today";
        assert_eq!(infer_strategy(long, false), Strategy::Comprehensive);
    }

    #[test]
    fn test_vs_is_exact_word() {
        assert_eq!(infer_strategy("tokio vs async-std", false), Strategy::Analytical);
        assert_eq!(infer_strategy("update the vsync settings please and thanks a lot for it all", false), Strategy::Comprehensive);
    }

    #[test]
    fn test_overrides() {
        let options = ContextBuildOptions {
            strategy: Some(Strategy::Minimal),
            ..Default::default()
        };
        let plan = resolve_plan("brainstorm ideas", &options, false);
        assert_eq!(plan.strategy, Strategy::Minimal);
        assert_eq!(plan.priority, Priority::Recency);

        let options = ContextBuildOptions {
            priority: Some(Priority::Depth),
            ..Default::default()
        };
        let plan = resolve_plan("compare a and b", &options, false);
        assert_eq!(plan, BuildPlan { strategy: Strategy::Analytical, priority: Priority::Depth });
    }
}
