//! Approval records, standing rules, and actors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use butlers_core::ActionId;

/// Lifecycle of a gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved; execution in progress.
    Approved,
    /// Rejected by a human.
    Rejected,
    /// Expired before a decision.
    Expired,
    /// Executed to completion.
    Executed,
}

impl ApprovalStatus {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Executed => "executed",
        }
    }

    /// Parse the column form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            "executed" => Some(Self::Executed),
            _ => None,
        }
    }

    /// Whether the status is terminal (no further transitions).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Executed)
    }
}

/// One gated action row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Action id.
    pub action_id: ActionId,
    /// The gated tool.
    pub tool_name: String,
    /// Frozen arguments.
    pub args: serde_json::Value,
    /// When the action was parked.
    pub requested_at: DateTime<Utc>,
    /// When an undecided action expires.
    pub expires_at: DateTime<Utc>,
    /// Current status.
    pub status: ApprovalStatus,
    /// Who decided (human identity or `rule:<id>`).
    pub decided_by: Option<String>,
    /// When the decision landed.
    pub decided_at: Option<DateTime<Utc>>,
    /// Execution result for executed actions.
    pub result: Option<serde_json::Value>,
}

/// A constraint over one argument of a gated tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgConstraint {
    /// The argument must equal this value exactly.
    Exact(serde_json::Value),
    /// The argument must be a string with this prefix.
    Prefix(String),
}

/// A pre-declared standing rule.
///
/// Rules are evaluated in insertion order; a rule matches when its tool
/// name matches, every declared constraint is satisfied, the rule is
/// active, within its use limit, and not past its expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandingRule {
    /// Rule id.
    pub rule_id: Uuid,
    /// The tool this rule covers.
    pub tool_name: String,
    /// Constraints keyed by argument name.
    pub arg_constraints: std::collections::BTreeMap<String, ArgConstraint>,
    /// Whether the rule is live.
    pub active: bool,
    /// Times the rule has pre-approved an action.
    pub use_count: i64,
    /// Optional cap on uses.
    pub use_limit: Option<i64>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// The human who declared the rule.
    pub owner: String,
    /// Creation time (evaluation order).
    pub created_at: DateTime<Utc>,
}

/// Who is asking for a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Identity string (e.g. a telegram user id, an operator name).
    pub id: String,
    /// Human or machine.
    pub kind: ActorKind,
}

/// Actor classification. Approval decisions are human-mediated: machine
/// actors are rejected with a machine-readable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// An authenticated human.
    Human,
    /// Any automated caller (butler, LLM session, cron).
    Machine,
}

impl Actor {
    /// A human actor.
    #[must_use]
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Human,
        }
    }

    /// A machine actor.
    #[must_use]
    pub fn machine(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ActorKind::Machine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::Expired,
            ApprovalStatus::Executed,
        ] {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(!ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
        assert!(ApprovalStatus::Executed.is_terminal());
    }
}
