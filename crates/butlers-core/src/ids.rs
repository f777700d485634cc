//! Typed identifiers.
//!
//! Newtype wrappers keep request lineage, sessions, deliveries, and
//! approval actions from being confused for one another in signatures.
//! `RequestId` is a UUIDv7 so inbox rows sort by creation time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $new:path) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh identifier.
            #[must_use]
            pub fn new() -> Self {
                Self($new())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id! {
    /// Immutable root identity of one ingested request (UUIDv7).
    ///
    /// Assigned once by Switchboard at ingest and propagated unchanged
    /// through every fanout hop.
    RequestId, Uuid::now_v7
}

uuid_id! {
    /// Identity of one dispatched subrequest within a fanout plan.
    SubrequestId, Uuid::new_v4
}

uuid_id! {
    /// Identity of one spawner session.
    SessionId, Uuid::new_v4
}

uuid_id! {
    /// Identity of one Messenger delivery request.
    DeliveryId, Uuid::new_v4
}

uuid_id! {
    /// Identity of one pending approval action.
    ActionId, Uuid::new_v4
}

/// Stable identity of one classification segment.
///
/// Unlike the UUID identifiers, segment ids are classifier-assigned
/// strings (stable across retries of the same plan), so this is a
/// string newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub String);

impl SegmentId {
    /// Wrap a segment id string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The segment id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A butler's globally unique name (e.g. `"switchboard"`, `"health"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ButlerName(pub String);

impl ButlerName {
    /// Wrap a butler name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ButlerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ButlerName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_v7_and_time_ordered() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert_eq!(a.as_uuid().get_version_num(), 7);
        assert!(a <= b, "v7 ids must be monotonic within one process");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_round_trip() {
        let id = DeliveryId::new();
        let parsed: DeliveryId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn butler_name_equality() {
        assert_eq!(ButlerName::from("health"), ButlerName::new("health"));
        assert_ne!(ButlerName::from("health"), ButlerName::from("general"));
    }
}
