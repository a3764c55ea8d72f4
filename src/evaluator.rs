//! Flag evaluation: the [flag algorithm](https://docs.launchdarkly.com/sdk/concepts/flag-evaluation-rules)
//! over the data in a [Store].
//!
//! Evaluation never fails outward. Every problem - a missing flag, a bad
//! variation index, a prerequisite cycle - collapses into an error
//! [`Reason`] on the returned [`Detail`], and the caller substitutes its
//! default value.

use crate::{
    big_segments::{BigSegmentStoreWrapper, BigSegmentsStatus, Membership},
    bucketing::bucket_user,
    models::{Clause, FeatureFlag, Op, RolloutKind, Segment, SegmentRule, VariationOrRollout},
    operators,
    store::Store,
    user::User,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, warn};

/// Why an evaluation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    UserNotSpecified,
    MalformedFlag,
    WrongType,
    Exception,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Why an evaluation produced the value it did.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Reason {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "FALLTHROUGH", rename_all = "camelCase")]
    Fallthrough {
        #[serde(skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    #[serde(rename = "TARGET_MATCH")]
    TargetMatch,
    #[serde(rename = "RULE_MATCH", rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        #[serde(skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    #[serde(rename = "PREREQUISITE_FAILED", rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    pub fn is_error(&self) -> bool {
        matches!(self, Reason::Error { .. })
    }

    /// True for results produced by an experiment or tracked rule, which
    /// force the reason onto the emitted event.
    pub fn is_in_experiment(&self) -> bool {
        matches!(
            self,
            Reason::Fallthrough { in_experiment: true }
                | Reason::RuleMatch { in_experiment: true, .. }
        )
    }
}

/// The full result of one evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail {
    /// The variation value, absent when evaluation errored.
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
    /// Set when any consulted segment needed the external membership
    /// store.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl Detail {
    pub fn error(error_kind: ErrorKind) -> Self {
        Self {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind },
            big_segments_status: None,
        }
    }

    /// The reason in wire form, with the big-segment status folded into
    /// the reason object when present.
    pub fn reason_json(&self) -> Value {
        let mut reason = serde_json::to_value(&self.reason).unwrap_or(Value::Null);
        if let (Some(status), Some(fields)) = (self.big_segments_status, reason.as_object_mut()) {
            if let Ok(status) = serde_json::to_value(status) {
                fields.insert("bigSegmentsStatus".to_string(), status);
            }
        }
        reason
    }
}

/// The evaluation of a prerequisite flag, reported so the caller can emit
/// a feature event for it.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvent {
    /// Key of the flag that required the prerequisite.
    pub prereq_of: String,
    pub flag_key: String,
    pub flag_version: u64,
    pub detail: Detail,
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct EvalResult {
    pub detail: Detail,
    /// Prerequisite evaluations in the order they happened, which is the
    /// order their events must be emitted in.
    pub prerequisite_events: Vec<PrerequisiteEvent>,
}

impl EvalResult {
    fn without_events(detail: Detail) -> Self {
        Self {
            detail,
            prerequisite_events: Vec::new(),
        }
    }
}

pub trait Evaluate {
    /// Determine the detailed variation result for a flag key.
    fn evaluate(&self, flag_key: &str, user: &User) -> EvalResult;
}

/// Used to evaluate flags by reading from a [Store]
/// and running the flag algorithm.
pub struct Evaluator<S> {
    store: S,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
}

impl<S: Store> Evaluator<S> {
    /// Create an evaluator for a [Store]
    pub fn new(store: S) -> Self {
        Self {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(store: S, big_segments: Arc<BigSegmentStoreWrapper>) -> Self {
        Self {
            store,
            big_segments: Some(big_segments),
        }
    }

    /// Evaluate a flag the caller already fetched.
    pub fn evaluate_flag(&self, flag: &FeatureFlag, user: &User) -> EvalResult {
        if user.key.is_empty() {
            warn!(flag = %flag.key, "user has no key, cannot evaluate");
            return EvalResult::without_events(Detail::error(ErrorKind::UserNotSpecified));
        }
        let mut evaluation = Evaluation::new(&self.store, user, self.big_segments.as_deref());
        let mut detail = evaluation.flag_value(flag);
        detail.big_segments_status = evaluation.big_segments_status;
        EvalResult {
            detail,
            prerequisite_events: evaluation.events,
        }
    }
}

impl<S: Store> Evaluate for Evaluator<S> {
    fn evaluate(&self, flag_key: &str, user: &User) -> EvalResult {
        if user.key.is_empty() {
            warn!(flag = %flag_key, "user has no key, cannot evaluate");
            return EvalResult::without_events(Detail::error(ErrorKind::UserNotSpecified));
        }
        match self.store.flag(flag_key) {
            Some(flag) => self.evaluate_flag(&flag, user),
            None => {
                warn!(flag = %flag_key, "flag not found in store");
                EvalResult::without_events(Detail::error(ErrorKind::FlagNotFound))
            }
        }
    }
}

/// What resolving a variation-or-rollout produced.
enum Resolved {
    Variation { index: i64, in_experiment: bool },
    /// Residual rollout weight: the user landed past every bucket.
    NoMatch,
    Malformed,
}

/// Helper for a single evaluation
///
/// Contains the actual evaluation implementation
struct Evaluation<'a, S> {
    store: &'a S,
    user: &'a User,
    big_segments: Option<&'a BigSegmentStoreWrapper>,
    /// Flag keys currently being evaluated above us, for cycle detection.
    prereq_chain: Vec<String>,
    /// Set once a prerequisite cycle is found; poisons the whole chain.
    cycle_found: bool,
    events: Vec<PrerequisiteEvent>,
    /// Membership is fetched at most once per evaluation.
    membership: Option<(Option<Arc<Membership>>, BigSegmentsStatus)>,
    big_segments_status: Option<BigSegmentsStatus>,
}

impl<'a, S: Store> Evaluation<'a, S> {
    fn new(store: &'a S, user: &'a User, big_segments: Option<&'a BigSegmentStoreWrapper>) -> Self {
        Self {
            store,
            user,
            big_segments,
            prereq_chain: Vec::new(),
            cycle_found: false,
            events: Vec::new(),
            membership: None,
            big_segments_status: None,
        }
    }

    /// Runs the evaluation algorithm for one flag.
    fn flag_value(&mut self, flag: &FeatureFlag) -> Detail {
        if !flag.on {
            return self.off_value(flag, Reason::Off);
        }

        if let Some(reason) = self.failed_prerequisite(flag) {
            if let Reason::Error { error_kind } = reason {
                return Detail::error(error_kind);
            }
            return self.off_value(flag, reason);
        }

        for target in &flag.targets {
            if target.values.iter().any(|key| *key == self.user.key) {
                return self.variation(flag, target.variation, Reason::TargetMatch);
            }
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if !self.all_clauses_match(&rule.clauses) {
                continue;
            }
            match self.resolve(flag, &rule.variation_or_rollout) {
                Resolved::Variation {
                    index,
                    in_experiment,
                } => {
                    let reason = Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    };
                    return self.variation(flag, index, reason);
                }
                // residual rollout weight leaves the rule unmatched
                Resolved::NoMatch => continue,
                Resolved::Malformed => {
                    error!(flag = %flag.key, rule = %rule.id, "rule has a malformed rollout");
                    return Detail::error(ErrorKind::MalformedFlag);
                }
            }
        }

        match self.resolve(flag, &flag.fallthrough) {
            Resolved::Variation {
                index,
                in_experiment,
            } => self.variation(flag, index, Reason::Fallthrough { in_experiment }),
            Resolved::NoMatch | Resolved::Malformed => {
                error!(flag = %flag.key, "flag has a malformed fallthrough");
                Detail::error(ErrorKind::MalformedFlag)
            }
        }
    }

    /// Checks prerequisite flags, emitting one event per evaluation.
    ///
    /// Returns the reason that short-circuits the dependent flag, if any.
    fn failed_prerequisite(&mut self, flag: &FeatureFlag) -> Option<Reason> {
        for prereq in &flag.prerequisites {
            if prereq.key == flag.key || self.prereq_chain.iter().any(|key| *key == prereq.key) {
                error!(
                    flag = %flag.key,
                    prerequisite = %prereq.key,
                    "prerequisite cycle detected"
                );
                self.cycle_found = true;
                return Some(Reason::Error {
                    error_kind: ErrorKind::MalformedFlag,
                });
            }

            let prereq_flag = match self.store.flag(&prereq.key) {
                Some(found) => found,
                None => {
                    return Some(Reason::PrerequisiteFailed {
                        prerequisite_key: prereq.key.clone(),
                    })
                }
            };

            self.prereq_chain.push(flag.key.clone());
            let detail = self.flag_value(&prereq_flag);
            self.prereq_chain.pop();

            let track_events =
                prereq_flag.track_events || experimentation_track(&prereq_flag, &detail.reason);
            self.events.push(PrerequisiteEvent {
                prereq_of: flag.key.clone(),
                flag_key: prereq_flag.key.clone(),
                flag_version: prereq_flag.version,
                detail: detail.clone(),
                track_events,
                debug_events_until_date: prereq_flag.debug_events_until_date,
            });

            if self.cycle_found {
                return Some(Reason::Error {
                    error_kind: ErrorKind::MalformedFlag,
                });
            }
            // the prerequisite must be on and serve the expected variation
            let selected = detail.variation_index.map(|index| index as i64);
            if !prereq_flag.on || selected != Some(prereq.variation) {
                return Some(Reason::PrerequisiteFailed {
                    prerequisite_key: prereq.key.clone(),
                });
            }
        }
        None
    }

    fn off_value(&self, flag: &FeatureFlag, reason: Reason) -> Detail {
        match flag.off_variation {
            Some(index) => self.variation(flag, index, reason),
            None => {
                error!(flag = %flag.key, "flag has no off variation");
                Detail::error(ErrorKind::MalformedFlag)
            }
        }
    }

    fn variation(&self, flag: &FeatureFlag, index: i64, reason: Reason) -> Detail {
        let value = if index >= 0 {
            flag.variations.get(index as usize)
        } else {
            None
        };
        match value {
            Some(value) => Detail {
                value: Some(value.clone()),
                variation_index: Some(index as usize),
                reason,
                big_segments_status: None,
            },
            None => {
                error!(flag = %flag.key, index, "variation index out of range");
                Detail::error(ErrorKind::MalformedFlag)
            }
        }
    }

    /// Pick the variation from a fixed index or a rollout.
    fn resolve(&self, flag: &FeatureFlag, vor: &VariationOrRollout) -> Resolved {
        if let Some(index) = vor.variation {
            return Resolved::Variation {
                index,
                in_experiment: false,
            };
        }
        let rollout = match &vor.rollout {
            Some(rollout) if !rollout.variations.is_empty() => rollout,
            _ => return Resolved::Malformed,
        };
        let experiment = match rollout.kind {
            RolloutKind::Rollout => false,
            RolloutKind::Experiment => true,
            RolloutKind::Unknown => return Resolved::Malformed,
        };
        // experiments always bucket by the user key
        let bucket_by = if experiment {
            None
        } else {
            rollout.bucket_by.as_deref()
        };
        let bucket = bucket_user(self.user, &flag.key, &flag.salt, bucket_by);

        let mut sum = 0f64;
        for weighted in &rollout.variations {
            // weights are hundred-thousandths, scaled to the bucket range
            sum += weighted.weight as f64 / 100_000f64;
            if bucket < sum {
                return Resolved::Variation {
                    index: weighted.variation,
                    in_experiment: experiment && !weighted.untracked,
                };
            }
        }
        Resolved::NoMatch
    }

    fn all_clauses_match(&mut self, clauses: &[Clause]) -> bool {
        clauses.iter().all(|clause| self.clause_matches(clause))
    }

    fn clause_matches(&mut self, clause: &Clause) -> bool {
        if clause.op == Op::SegmentMatch {
            let matched = clause.values.iter().any(|value| {
                value
                    .as_str()
                    .map(|key| self.segment_contains_user(key))
                    .unwrap_or(false)
            });
            return matched != clause.negate;
        }
        self.clause_matches_attributes(clause)
    }

    /// Existential match of the clause against the user's attribute
    /// values; `negate` inverts the result.
    fn clause_matches_attributes(&self, clause: &Clause) -> bool {
        let attribute = match self.user.attribute(&clause.attribute) {
            Some(value) => value,
            None => return false,
        };
        let matched = match &attribute {
            Value::Array(elements) => elements
                .iter()
                .any(|element| clause_matches_value(clause, element)),
            single => clause_matches_value(clause, single),
        };
        matched != clause.negate
    }

    fn segment_contains_user(&mut self, segment_key: &str) -> bool {
        let segment = match self.store.segment(segment_key) {
            Some(segment) => segment,
            None => return false,
        };
        if segment.unbounded {
            return self.big_segment_contains_user(&segment);
        }
        self.bounded_segment_contains_user(&segment)
    }

    fn bounded_segment_contains_user(&self, segment: &Segment) -> bool {
        // an explicit include always wins
        if segment.included.iter().any(|key| *key == self.user.key) {
            return true;
        }
        if segment.excluded.iter().any(|key| *key == self.user.key) {
            return false;
        }
        segment
            .rules
            .iter()
            .any(|rule| self.segment_rule_matches(rule, segment))
    }

    fn segment_rule_matches(&self, rule: &SegmentRule, segment: &Segment) -> bool {
        if !rule
            .clauses
            .iter()
            .all(|clause| self.clause_matches_attributes(clause))
        {
            return false;
        }
        match rule.weight {
            None => true,
            Some(weight) => {
                let bucket = bucket_user(
                    self.user,
                    &segment.key,
                    &segment.salt,
                    rule.bucket_by.as_deref(),
                );
                bucket * 100_000f64 < weight as f64
            }
        }
    }

    fn big_segment_contains_user(&mut self, segment: &Segment) -> bool {
        let reference = match segment.external_reference() {
            Some(reference) => reference,
            None => {
                warn!(segment = %segment.key, "unbounded segment has no generation");
                self.note_big_segments_status(BigSegmentsStatus::NotConfigured);
                return false;
            }
        };
        let wrapper = match self.big_segments {
            Some(wrapper) => wrapper,
            None => {
                warn!(
                    segment = %segment.key,
                    "flag data references a big segment but no store is configured"
                );
                self.note_big_segments_status(BigSegmentsStatus::NotConfigured);
                return false;
            }
        };

        if self.membership.is_none() {
            self.membership = Some(wrapper.get_user_membership(&self.user.key));
        }
        let (membership, status) = self
            .membership
            .clone()
            .unwrap_or((None, BigSegmentsStatus::StoreError));
        self.note_big_segments_status(status);

        match membership.as_ref().and_then(|m| m.get(&reference)) {
            Some(included) => *included,
            // unknown membership falls back to the segment's own rules
            None => self.bounded_segment_contains_user(segment),
        }
    }

    fn note_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => current.worst(status),
            None => status,
        });
    }
}

fn clause_matches_value(clause: &Clause, user_value: &Value) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| operators::apply(clause.op, user_value, clause_value))
}

/// Whether experimentation settings force this evaluation onto the event
/// stream with its reason attached: experiment rollouts, tracked rules,
/// and tracked fallthroughs.
pub fn experimentation_track(flag: &FeatureFlag, reason: &Reason) -> bool {
    if reason.is_in_experiment() {
        return true;
    }
    match reason {
        Reason::Fallthrough { .. } => flag.track_events_fallthrough,
        Reason::RuleMatch { rule_index, .. } => flag
            .rules
            .get(*rule_index)
            .map(|rule| rule.track_events)
            .unwrap_or(false),
        _ => false,
    }
}
