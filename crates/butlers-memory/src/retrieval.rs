//! Budgeted, deterministic context retrieval.
//!
//! Score = `0.4·relevance + 0.3·importance + 0.2·recency +
//! 0.1·effective_confidence`, ties broken by `score DESC, created_at
//! DESC, id ASC`. Each section (facts, rules, episodes) has a quota,
//! and the whole block is capped by a token budget using the same
//! ~4-characters-per-token approximation the runtime uses.

use chrono::{DateTime, Utc};

use crate::types::{Fact, MemoryRule, RuleMaturity};

/// Per-call retrieval budget and quotas.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalBudget {
    /// Total token budget for the context block.
    pub max_tokens: usize,
    /// Max facts included.
    pub max_facts: usize,
    /// Max rules included.
    pub max_rules: usize,
    /// Max recent episodes included.
    pub max_episodes: usize,
}

impl Default for RetrievalBudget {
    fn default() -> Self {
        Self {
            max_tokens: 1500,
            max_facts: 20,
            max_rules: 10,
            max_episodes: 5,
        }
    }
}

/// Candidate artifacts for one retrieval.
#[derive(Debug, Clone, Default)]
pub struct RetrievalInput {
    /// Candidate facts (already tenant/scope filtered).
    pub facts: Vec<Fact>,
    /// Candidate rules (already tenant/scope filtered).
    pub rules: Vec<MemoryRule>,
    /// Recent episode texts, newest first.
    pub episodes: Vec<String>,
}

/// Approximate token count (~4 characters per token).
#[must_use]
pub fn approximate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Word-overlap relevance between a query and a text, in `[0, 1]`.
fn relevance(query: &str, text: &str) -> f64 {
    let query_words: Vec<String> = tokenize(query);
    if query_words.is_empty() {
        return 0.0;
    }
    let text_words: std::collections::BTreeSet<String> = tokenize(text).into_iter().collect();
    let hits = query_words
        .iter()
        .filter(|w| text_words.contains(*w))
        .count();
    hits as f64 / query_words.len() as f64
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Recency weight in `[0, 1]`: 1 now, halving every 30 days.
fn recency(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let days = (now - created_at).num_seconds() as f64 / 86_400.0;
    0.5f64.powf(days.max(0.0) / 30.0)
}

fn fact_score(fact: &Fact, query: &str, now: DateTime<Utc>) -> f64 {
    let text = format!("{} {} {}", fact.subject, fact.predicate, fact.content);
    0.4 * relevance(query, &text)
        + 0.3 * fact.importance.clamp(0.0, 1.0)
        + 0.2 * recency(fact.created_at, now)
        + 0.1 * fact.effective_confidence(now).clamp(0.0, 1.0)
}

fn rule_score(rule: &MemoryRule, query: &str, now: DateTime<Utc>) -> f64 {
    let maturity_weight = match rule.maturity {
        RuleMaturity::Proven => 1.0,
        RuleMaturity::Established => 0.7,
        RuleMaturity::Candidate => 0.4,
        RuleMaturity::AntiPattern => 0.0,
    };
    0.4 * relevance(query, &rule.content)
        + 0.3 * maturity_weight
        + 0.2 * recency(rule.created_at, now)
        + 0.1 * maturity_weight
}

/// Order candidates by `score DESC, created_at DESC, id ASC`.
fn order_key(score: f64, created_at: DateTime<Utc>, id: uuid::Uuid) -> impl Ord {
    // Total order for f64 scores: scale to integer millionths. Scores
    // are bounded in [0, 1] by construction.
    let scaled = (score.clamp(0.0, 1.0) * 1_000_000.0) as i64;
    (std::cmp::Reverse(scaled), std::cmp::Reverse(created_at), id)
}

/// Build the memory context block.
///
/// Deterministic for a given input and `now`; sections are filled in
/// order (rules, facts, episodes) under their quotas, then the whole
/// block is truncated entry-wise to the token budget.
#[must_use]
pub fn build_context(
    query: &str,
    input: &RetrievalInput,
    budget: RetrievalBudget,
    now: DateTime<Utc>,
) -> Option<String> {
    let mut rules: Vec<&MemoryRule> = input
        .rules
        .iter()
        .filter(|r| r.maturity != RuleMaturity::AntiPattern)
        .collect();
    rules.sort_by_key(|r| order_key(rule_score(r, query, now), r.created_at, r.id));
    rules.truncate(budget.max_rules);

    let mut facts: Vec<&Fact> = input.facts.iter().collect();
    facts.sort_by_key(|f| order_key(fact_score(f, query, now), f.created_at, f.id));
    facts.truncate(budget.max_facts);

    let episodes: Vec<&String> = input.episodes.iter().take(budget.max_episodes).collect();

    if rules.is_empty() && facts.is_empty() && episodes.is_empty() {
        return None;
    }

    let mut lines: Vec<String> = Vec::new();
    if !rules.is_empty() {
        lines.push("## Guidance".to_owned());
        for rule in rules {
            lines.push(format!("- {}", rule.content));
        }
    }
    if !facts.is_empty() {
        lines.push("## Known facts".to_owned());
        for fact in facts {
            lines.push(format!("- {} {}: {}", fact.subject, fact.predicate, fact.content));
        }
    }
    if !episodes.is_empty() {
        lines.push("## Recent context".to_owned());
        for episode in episodes {
            lines.push(format!("- {episode}"));
        }
    }

    // Enforce the token budget entry-wise: stop before the line that
    // would cross it (headers always fit or the block is dropped).
    let mut out = String::new();
    let mut used = 0usize;
    for line in lines {
        let cost = approximate_tokens(&line).saturating_add(1);
        if used.saturating_add(cost) > budget.max_tokens {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
        used = used.saturating_add(cost);
    }

    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fact(subject: &str, content: &str, importance: f64, days_old: i64) -> Fact {
        let now = Utc::now();
        Fact {
            id: Uuid::new_v4(),
            tenant: "t".to_owned(),
            scope: "global".to_owned(),
            subject: subject.to_owned(),
            predicate: "is".to_owned(),
            content: content.to_owned(),
            state: crate::types::FactState::Active,
            confidence: 0.9,
            decay_rate: 0.01,
            importance,
            last_confirmed_at: now - chrono::Duration::days(days_old),
            created_at: now - chrono::Duration::days(days_old),
        }
    }

    fn rule(content: &str, maturity: RuleMaturity) -> MemoryRule {
        MemoryRule {
            id: Uuid::new_v4(),
            tenant: "t".to_owned(),
            scope: "global".to_owned(),
            content: content.to_owned(),
            maturity,
            helpful_count: 0,
            harmful_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn token_approximation() {
        assert_eq!(approximate_tokens(""), 0);
        assert_eq!(approximate_tokens("abcd"), 1);
        assert_eq!(approximate_tokens("abcde"), 2);
    }

    #[test]
    fn relevance_rewards_overlap() {
        assert!(relevance("blood pressure reading", "blood pressure is 120/80") > 0.5);
        assert_eq!(relevance("blood pressure", "the weather is nice"), 0.0);
    }

    #[test]
    fn retrieval_is_deterministic() {
        let now = Utc::now();
        let input = RetrievalInput {
            facts: vec![
                fact("alice", "user's sister", 0.9, 2),
                fact("coffee", "preferred drink", 0.5, 10),
            ],
            rules: vec![rule("confirm before sending email", RuleMaturity::Proven)],
            episodes: vec!["logged BP yesterday".to_owned()],
        };
        let a = build_context("call alice", &input, RetrievalBudget::default(), now);
        let b = build_context("call alice", &input, RetrievalBudget::default(), now);
        assert_eq!(a, b);
        assert!(a.unwrap().contains("alice"));
    }

    #[test]
    fn anti_patterns_are_suppressed() {
        let input = RetrievalInput {
            rules: vec![
                rule("useful guidance", RuleMaturity::Established),
                rule("harmful guidance", RuleMaturity::AntiPattern),
            ],
            ..RetrievalInput::default()
        };
        let out = build_context("anything", &input, RetrievalBudget::default(), Utc::now())
            .unwrap();
        assert!(out.contains("useful guidance"));
        assert!(!out.contains("harmful guidance"));
    }

    #[test]
    fn quotas_cap_each_section() {
        let input = RetrievalInput {
            facts: (0..50).map(|i| fact("subj", &format!("fact {i}"), 0.5, 1)).collect(),
            ..RetrievalInput::default()
        };
        let budget = RetrievalBudget {
            max_facts: 3,
            ..RetrievalBudget::default()
        };
        let out = build_context("subj", &input, budget, Utc::now()).unwrap();
        // Header line plus exactly three fact lines.
        assert_eq!(out.lines().count(), 4);
    }

    #[test]
    fn token_budget_truncates_entry_wise() {
        let input = RetrievalInput {
            facts: (0..20)
                .map(|i| fact("subject", &"x".repeat(100), 0.5, i))
                .collect(),
            ..RetrievalInput::default()
        };
        let budget = RetrievalBudget {
            max_tokens: 60,
            ..RetrievalBudget::default()
        };
        let out = build_context("subject", &input, budget, Utc::now()).unwrap();
        assert!(approximate_tokens(&out) <= 60 + out.lines().count());
        assert!(out.lines().count() < 21);
    }

    #[test]
    fn empty_input_yields_no_context() {
        assert_eq!(
            build_context("q", &RetrievalInput::default(), RetrievalBudget::default(), Utc::now()),
            None
        );
    }

    #[test]
    fn higher_relevance_sorts_first() {
        let now = Utc::now();
        let input = RetrievalInput {
            facts: vec![
                fact("weather", "sunny today", 0.5, 1),
                fact("alice", "sister birthday tomorrow", 0.5, 1),
            ],
            ..RetrievalInput::default()
        };
        let out = build_context("alice birthday", &input, RetrievalBudget::default(), now)
            .unwrap();
        let alice_pos = out.find("alice").unwrap();
        let weather_pos = out.find("weather").unwrap();
        assert!(alice_pos < weather_pos);
    }
}
