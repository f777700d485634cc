//! Memory artifact types and their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Consolidation lifecycle of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationState {
    /// Awaiting the consolidation worker.
    Pending,
    /// Distilled into facts/rules.
    Consolidated,
    /// Consolidation failed; retry metadata tracks attempts.
    Failed,
    /// Retries exhausted; parked for inspection.
    DeadLetter,
}

impl ConsolidationState {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Consolidated => "consolidated",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse the column form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "consolidated" => Some(Self::Consolidated),
            "failed" => Some(Self::Failed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Whether the transition to `next` is legal.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Consolidated)
                | (Self::Pending, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Failed, Self::DeadLetter)
        )
    }
}

/// An append-only observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Episode id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant: String,
    /// Observation text.
    pub content: String,
    /// Consolidation lifecycle.
    pub consolidation_state: ConsolidationState,
    /// Consolidation retry count.
    pub retry_count: i32,
    /// TTL expiry.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Validity lifecycle of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactState {
    /// Believed and retrievable.
    Active,
    /// Decayed below the fading threshold; retrievable with a caveat.
    Fading,
    /// Replaced by a newer fact for the same subject/predicate.
    Superseded,
    /// Aged out.
    Expired,
    /// Explicitly withdrawn (soft delete).
    Retracted,
}

impl FactState {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Fading => "fading",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
            Self::Retracted => "retracted",
        }
    }

    /// Parse the column form. The legacy string `forgotten` is an
    /// input alias normalized to [`Self::Retracted`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "fading" => Some(Self::Fading),
            "superseded" => Some(Self::Superseded),
            "expired" => Some(Self::Expired),
            "retracted" | "forgotten" => Some(Self::Retracted),
            _ => None,
        }
    }

    /// Whether the transition to `next` is legal.
    #[must_use]
    pub fn can_transition(self, next: Self) -> bool {
        match self {
            Self::Active => matches!(
                next,
                Self::Fading | Self::Superseded | Self::Expired | Self::Retracted
            ),
            Self::Fading => matches!(
                next,
                Self::Active | Self::Superseded | Self::Expired | Self::Retracted
            ),
            Self::Superseded | Self::Expired | Self::Retracted => false,
        }
    }
}

/// A subject/predicate/content triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    /// Fact id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant: String,
    /// Visibility scope (a butler name or `global`).
    pub scope: String,
    /// Subject.
    pub subject: String,
    /// Predicate.
    pub predicate: String,
    /// Content.
    pub content: String,
    /// Validity state.
    pub state: FactState,
    /// Base confidence at last confirmation.
    pub confidence: f64,
    /// Exponential decay rate per day.
    pub decay_rate: f64,
    /// Importance weight for retrieval.
    pub importance: f64,
    /// Last confirmation time.
    pub last_confirmed_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Effective confidence after exponential decay:
/// `confidence · exp(-decay_rate · days_since_last_confirmed)`.
#[must_use]
pub fn effective_confidence(
    confidence: f64,
    decay_rate: f64,
    last_confirmed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let days = (now - last_confirmed_at).num_seconds() as f64 / 86_400.0;
    confidence * (-decay_rate * days.max(0.0)).exp()
}

impl Fact {
    /// This fact's decayed confidence at `now`.
    #[must_use]
    pub fn effective_confidence(&self, now: DateTime<Utc>) -> f64 {
        effective_confidence(self.confidence, self.decay_rate, self.last_confirmed_at, now)
    }
}

/// Maturity of a behavioral rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMaturity {
    /// Observed once; not yet trusted.
    Candidate,
    /// Repeatedly helpful.
    Established,
    /// Consistently helpful over a long window.
    Proven,
    /// Demonstrated harmful; suppressed from retrieval.
    AntiPattern,
}

impl RuleMaturity {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Established => "established",
            Self::Proven => "proven",
            Self::AntiPattern => "anti_pattern",
        }
    }

    /// Parse the column form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(Self::Candidate),
            "established" => Some(Self::Established),
            "proven" => Some(Self::Proven),
            "anti_pattern" => Some(Self::AntiPattern),
            _ => None,
        }
    }
}

/// A behavioral rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRule {
    /// Rule id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant: String,
    /// Visibility scope.
    pub scope: String,
    /// Rule text.
    pub content: String,
    /// Maturity.
    pub maturity: RuleMaturity,
    /// Helpful evidence count.
    pub helpful_count: i64,
    /// Harmful evidence count.
    pub harmful_count: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl MemoryRule {
    /// Recompute maturity from evidence. Harmful evidence outweighs
    /// helpful: any two harmful observations make an anti-pattern
    /// regardless of helpful volume.
    #[must_use]
    pub fn assess_maturity(&self) -> RuleMaturity {
        if self.harmful_count >= 2 {
            return RuleMaturity::AntiPattern;
        }
        if self.harmful_count > 0 && self.helpful_count < self.harmful_count.saturating_mul(5) {
            return RuleMaturity::Candidate;
        }
        match self.helpful_count {
            0..=2 => RuleMaturity::Candidate,
            3..=9 => RuleMaturity::Established,
            _ => RuleMaturity::Proven,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forgotten_normalizes_to_retracted() {
        assert_eq!(FactState::parse("forgotten"), Some(FactState::Retracted));
        assert_eq!(FactState::parse("retracted"), Some(FactState::Retracted));
    }

    #[test]
    fn fact_terminal_states_cannot_transition() {
        for terminal in [FactState::Superseded, FactState::Expired, FactState::Retracted] {
            for next in [FactState::Active, FactState::Fading, FactState::Retracted] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn fading_facts_can_recover() {
        assert!(FactState::Fading.can_transition(FactState::Active));
        assert!(FactState::Active.can_transition(FactState::Fading));
    }

    #[test]
    fn episode_retry_loop() {
        assert!(ConsolidationState::Pending.can_transition(ConsolidationState::Failed));
        assert!(ConsolidationState::Failed.can_transition(ConsolidationState::Pending));
        assert!(ConsolidationState::Failed.can_transition(ConsolidationState::DeadLetter));
        assert!(!ConsolidationState::Consolidated.can_transition(ConsolidationState::Pending));
    }

    #[test]
    fn confidence_decays_exponentially() {
        let now = Utc::now();
        let fresh = effective_confidence(0.8, 0.01, now, now);
        assert!((fresh - 0.8).abs() < 1e-9);

        let old = effective_confidence(0.8, 0.01, now - chrono::Duration::days(100), now);
        assert!((old - 0.8 * (-1.0f64).exp()).abs() < 1e-6);
        assert!(old < fresh);
    }

    #[test]
    fn future_confirmation_does_not_inflate_confidence() {
        let now = Utc::now();
        let v = effective_confidence(0.8, 0.01, now + chrono::Duration::days(10), now);
        assert!((v - 0.8).abs() < 1e-9);
    }

    #[test]
    fn harmful_evidence_outweighs_helpful() {
        let rule = MemoryRule {
            id: Uuid::new_v4(),
            tenant: "t".to_owned(),
            scope: "global".to_owned(),
            content: "always do X".to_owned(),
            maturity: RuleMaturity::Proven,
            helpful_count: 100,
            harmful_count: 2,
            created_at: Utc::now(),
        };
        assert_eq!(rule.assess_maturity(), RuleMaturity::AntiPattern);
    }

    #[test]
    fn maturity_progression_by_helpful_evidence() {
        let mut rule = MemoryRule {
            id: Uuid::new_v4(),
            tenant: "t".to_owned(),
            scope: "global".to_owned(),
            content: "prefer brief replies".to_owned(),
            maturity: RuleMaturity::Candidate,
            helpful_count: 0,
            harmful_count: 0,
            created_at: Utc::now(),
        };
        assert_eq!(rule.assess_maturity(), RuleMaturity::Candidate);
        rule.helpful_count = 5;
        assert_eq!(rule.assess_maturity(), RuleMaturity::Established);
        rule.helpful_count = 20;
        assert_eq!(rule.assess_maturity(), RuleMaturity::Proven);
    }
}
