//! Fanout plans and conflict arbitration.

use serde::{Deserialize, Serialize};

use butlers_core::{ButlerName, SegmentId, SubrequestId};

/// One classified segment bound for one butler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Target butler name.
    pub butler: ButlerName,
    /// The prompt extracted for that butler.
    pub prompt: String,
    /// Classifier-assigned stable id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<SegmentId>,
    /// Classifier rationale, kept for the routing log only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Arbitration priority for overlapping segments; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// For `conditional` plans: indices of segments that must succeed
    /// before this one runs.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl Segment {
    /// A plain segment.
    #[must_use]
    pub fn new(butler: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            butler: ButlerName::new(butler),
            prompt: prompt.into(),
            segment_id: None,
            rationale: None,
            priority: 0,
            depends_on: Vec::new(),
        }
    }
}

/// Execution shape of a fanout plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
    /// All subroutes run concurrently.
    #[default]
    Parallel,
    /// Subroutes run strictly in the order given; the abort policy
    /// decides whether later subroutes run after a failure.
    Ordered,
    /// Subroutes run iff their declared upstreams succeeded.
    Conditional,
}

/// A complete plan for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutPlan {
    /// Segments to dispatch.
    pub segments: Vec<Segment>,
    /// Execution shape.
    #[serde(default)]
    pub mode: DependencyMode,
    /// In `ordered` mode: whether later subroutes still run after a
    /// failure.
    #[serde(default)]
    pub continue_after_failure: bool,
}

impl FanoutPlan {
    /// A single-segment parallel plan.
    #[must_use]
    pub fn single(segment: Segment) -> Self {
        Self {
            segments: vec![segment],
            mode: DependencyMode::Parallel,
            continue_after_failure: false,
        }
    }
}

/// Deterministic conflict arbitration for overlapping grouped
/// subrequests: highest declared priority, then lexical butler name,
/// then lexical subrequest id.
#[must_use]
pub fn arbitrate<'a>(
    candidates: &'a [(Segment, SubrequestId)],
) -> Option<&'a (Segment, SubrequestId)> {
    candidates.iter().min_by(|(a, a_id), (b, b_id)| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.butler.as_str().cmp(b.butler.as_str()))
            .then_with(|| a_id.to_string().cmp(&b_id.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbitration_prefers_priority() {
        let mut low = Segment::new("relationship", "a");
        low.priority = 1;
        let mut high = Segment::new("zzz", "b");
        high.priority = 5;
        let candidates = vec![(low, SubrequestId::new()), (high.clone(), SubrequestId::new())];
        let winner = arbitrate(&candidates).unwrap();
        assert_eq!(winner.0.butler, high.butler);
    }

    #[test]
    fn arbitration_ties_break_on_butler_name_then_id() {
        let a = Segment::new("alpha", "x");
        let b = Segment::new("beta", "x");
        let candidates = vec![(b, SubrequestId::new()), (a.clone(), SubrequestId::new())];
        let winner = arbitrate(&candidates).unwrap();
        assert_eq!(winner.0.butler.as_str(), "alpha");
    }

    #[test]
    fn arbitration_is_deterministic_for_identical_segments() {
        let seg = Segment::new("health", "x");
        let id_a = SubrequestId::new();
        let id_b = SubrequestId::new();
        let expected = if id_a.to_string() < id_b.to_string() {
            id_a
        } else {
            id_b
        };
        let candidates = vec![(seg.clone(), id_a), (seg, id_b)];
        assert_eq!(arbitrate(&candidates).unwrap().1, expected);
    }

    #[test]
    fn plan_defaults() {
        let plan: FanoutPlan = serde_json::from_str(
            r#"{"segments": [{"butler": "general", "prompt": "hi"}]}"#,
        )
        .unwrap();
        assert_eq!(plan.mode, DependencyMode::Parallel);
        assert!(!plan.continue_after_failure);
        assert_eq!(plan.segments[0].priority, 0);
    }
}
