//! Interactive request lifecycle.

use serde::{Deserialize, Serialize};

/// User-visible lifecycle of an ingested request.
///
/// Interactive channels always terminate in [`Parsed`](Self::Parsed) or
/// [`Errored`](Self::Errored); silent drops are prohibited at every hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Accepted and being worked on.
    Progress,
    /// All required subroutes succeeded.
    Parsed,
    /// At least one required subroute failed; an actionable message
    /// accompanies this state.
    Errored,
}

impl LifecycleState {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Parsed | Self::Errored)
    }

    /// The telegram reaction emoji signalling this state.
    #[must_use]
    pub fn telegram_reaction(self) -> &'static str {
        match self {
            Self::Progress => "👀",
            Self::Parsed => "✍",
            Self::Errored => "👾",
        }
    }

    /// The wire name used in inbox rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "PROGRESS",
            Self::Parsed => "PARSED",
            Self::Errored => "ERRORED",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!LifecycleState::Progress.is_terminal());
        assert!(LifecycleState::Parsed.is_terminal());
        assert!(LifecycleState::Errored.is_terminal());
    }

    #[test]
    fn wire_names_are_screaming_snake() {
        let json = serde_json::to_string(&LifecycleState::Progress).unwrap();
        assert_eq!(json, "\"PROGRESS\"");
        let back: LifecycleState = serde_json::from_str("\"ERRORED\"").unwrap();
        assert_eq!(back, LifecycleState::Errored);
    }

    #[test]
    fn each_state_has_a_distinct_reaction() {
        let reactions = [
            LifecycleState::Progress.telegram_reaction(),
            LifecycleState::Parsed.telegram_reaction(),
            LifecycleState::Errored.telegram_reaction(),
        ];
        assert_eq!(
            reactions.len(),
            reactions.iter().collect::<std::collections::HashSet<_>>().len()
        );
    }
}
