//! Trigger provenance for spawner sessions.

use serde::{Deserialize, Serialize};

/// What caused a spawner session.
///
/// Serialized as a single string: `tick`, `schedule:<name>`, `trigger`,
/// or `external`, matching the session-log column format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// Scheduler tick housekeeping.
    Tick,
    /// A named scheduled task fired.
    Schedule(String),
    /// Direct or routed `trigger` tool call.
    Trigger,
    /// External (non-routed) invocation.
    External,
}

impl TriggerSource {
    /// The wire/column form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Tick => "tick".to_owned(),
            Self::Schedule(name) => format!("schedule:{name}"),
            Self::Trigger => "trigger".to_owned(),
            Self::External => "external".to_owned(),
        }
    }

    /// Parse the wire/column form. Unknown values return `None`.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "tick" => Some(Self::Tick),
            "trigger" => Some(Self::Trigger),
            "external" => Some(Self::External),
            other => other
                .strip_prefix("schedule:")
                .map(|name| Self::Schedule(name.to_owned())),
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for TriggerSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for TriggerSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_wire(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown trigger source: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for src in [
            TriggerSource::Tick,
            TriggerSource::Schedule("morning-digest".to_owned()),
            TriggerSource::Trigger,
            TriggerSource::External,
        ] {
            assert_eq!(TriggerSource::from_wire(&src.to_wire()), Some(src.clone()));
        }
    }

    #[test]
    fn schedule_carries_name() {
        let src = TriggerSource::from_wire("schedule:nightly").unwrap();
        assert_eq!(src, TriggerSource::Schedule("nightly".to_owned()));
        assert_eq!(src.to_wire(), "schedule:nightly");
    }

    #[test]
    fn unknown_wire_value_is_rejected() {
        assert_eq!(TriggerSource::from_wire("cron"), None);
        let parsed: Result<TriggerSource, _> = serde_json::from_str("\"cron\"");
        assert!(parsed.is_err());
    }
}
