//! Data model for flag and segment configuration as delivered by the
//! control plane.
//!
//! Field names follow the wire format; everything deserializes leniently so
//! a partial patch payload never breaks an update.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single feature flag definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    pub on: bool,
    pub prerequisites: Vec<Prerequisite>,
    pub salt: String,
    pub targets: Vec<Target>,
    pub rules: Vec<Rule>,
    pub fallthrough: VariationOrRollout,
    pub off_variation: Option<i64>,
    pub variations: Vec<Value>,
    pub track_events: bool,
    pub track_events_fallthrough: bool,
    pub debug_events_until_date: Option<u64>,
    pub deleted: bool,
    pub client_side: bool,
}

/// Another flag that must evaluate to a specific variation before the
/// dependent flag is allowed past its off state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: i64,
}

/// Individual user keys pinned to a variation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Target {
    pub values: Vec<String>,
    pub variation: i64,
}

/// A targeting rule: all clauses must match.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    pub track_events: bool,
}

/// Either a fixed variation index or a percentage rollout.
///
/// Exactly one of the two fields is expected to be present; a value with
/// neither is malformed and surfaces as an evaluation error.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VariationOrRollout {
    pub variation: Option<i64>,
    pub rollout: Option<Rollout>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    Rollout,
    Experiment,
    #[serde(other)]
    Unknown,
}

impl Default for RolloutKind {
    fn default() -> Self {
        RolloutKind::Rollout
    }
}

/// Percentage rollout over the flag's variations.
///
/// Weights are integers in hundred-thousandths and may sum to less than
/// 100000, leaving residual users unmatched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Rollout {
    pub kind: RolloutKind,
    pub bucket_by: Option<String>,
    pub variations: Vec<WeightedVariation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: i64,
    pub weight: i64,
    pub untracked: bool,
}

/// A single condition over one user attribute.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Clause {
    pub attribute: String,
    pub op: Op,
    pub values: Vec<Value>,
    pub negate: bool,
}

/// Clause operators.
///
/// Operators added to the protocol after this build deserialize as
/// [`Op::Unknown`] and never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

impl Default for Op {
    fn default() -> Self {
        Op::Unknown
    }
}

/// A user segment definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    pub included: Vec<String>,
    pub excluded: Vec<String>,
    pub salt: String,
    pub rules: Vec<SegmentRule>,
    pub unbounded: bool,
    pub generation: Option<i64>,
    pub deleted: bool,
}

impl Segment {
    /// Reference under which an unbounded segment's membership is stored
    /// externally. Unbounded segments without a generation cannot be
    /// queried.
    pub fn external_reference(&self) -> Option<String> {
        match (self.unbounded, self.generation) {
            (true, Some(generation)) => Some(format!("{}.g{}", self.key, generation)),
            _ => None,
        }
    }
}

/// A rule inside a segment: all clauses must match, then an optional
/// percentage weight narrows the matching population.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SegmentRule {
    pub clauses: Vec<Clause>,
    pub weight: Option<i64>,
    pub bucket_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parses_from_wire_format() {
        let raw = r#"{
            "key": "flag-key",
            "version": 3,
            "on": true,
            "salt": "abc123",
            "offVariation": 1,
            "fallthrough": {"rollout": {"variations": [{"variation": 0, "weight": 60000}, {"variation": 1, "weight": 40000}]}},
            "rules": [{"id": "r1", "variation": 0, "clauses": [{"attribute": "country", "op": "in", "values": ["de"], "negate": false}], "trackEvents": true}],
            "prerequisites": [{"key": "other", "variation": 0}],
            "variations": [true, false],
            "trackEventsFallthrough": true,
            "debugEventsUntilDate": 1500000000000
        }"#;
        let flag: FeatureFlag = serde_json::from_str(raw).expect("parse flag");
        assert_eq!(flag.key, "flag-key");
        assert_eq!(flag.version, 3);
        assert_eq!(flag.off_variation, Some(1));
        assert_eq!(flag.prerequisites.len(), 1);
        assert_eq!(flag.rules[0].clauses[0].op, Op::In);
        assert!(flag.rules[0].track_events);
        assert!(flag.track_events_fallthrough);
        assert_eq!(flag.debug_events_until_date, Some(1_500_000_000_000));
        let rollout = flag.fallthrough.rollout.expect("rollout");
        assert_eq!(rollout.kind, RolloutKind::Rollout);
        assert_eq!(rollout.variations[0].weight, 60000);
    }

    #[test]
    fn unrecognized_operator_is_tolerated() {
        let clause: Clause =
            serde_json::from_str(r#"{"attribute": "x", "op": "telepathy", "values": []}"#)
                .expect("parse clause");
        assert_eq!(clause.op, Op::Unknown);
    }

    #[test]
    fn rule_variation_is_flattened() {
        let rule: Rule = serde_json::from_str(r#"{"id": "r", "variation": 2}"#).expect("parse");
        assert_eq!(rule.variation_or_rollout.variation, Some(2));
        assert!(rule.variation_or_rollout.rollout.is_none());
    }

    #[test]
    fn segment_reference_requires_generation() {
        let mut segment = Segment {
            key: "seg".into(),
            unbounded: true,
            ..Segment::default()
        };
        assert_eq!(segment.external_reference(), None);
        segment.generation = Some(2);
        assert_eq!(segment.external_reference().as_deref(), Some("seg.g2"));
        segment.unbounded = false;
        assert_eq!(segment.external_reference(), None);
    }
}
