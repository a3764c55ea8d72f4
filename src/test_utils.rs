use crate::{
    message::Message,
    models::{
        Clause, FeatureFlag, Op, Prerequisite, Rollout, RolloutKind, Rule, Segment, SegmentRule,
        Target, VariationOrRollout, WeightedVariation,
    },
    sender::{EventSender, EventSenderResult},
    source::Source,
    store::{DataKind, MemoryStore, Store, StoreItem},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, convert::Infallible, sync::Arc};

/// A pre-initialized in-memory store that tests can fill directly.
pub struct MockStore {
    inner: MemoryStore,
}

impl MockStore {
    pub fn new() -> Self {
        let inner = MemoryStore::new();
        inner.init(vec![
            (DataKind::Segments, vec![]),
            (DataKind::Features, vec![]),
        ]);
        Self { inner }
    }

    pub fn uninitialized() -> Self {
        Self {
            inner: MemoryStore::new(),
        }
    }

    pub fn add(&mut self, flag: FeatureFlag) {
        self.inner
            .upsert(DataKind::Features, &flag.key.clone(), StoreItem::Flag(flag));
    }

    pub fn add_segment(&mut self, segment: Segment) {
        self.inner.upsert(
            DataKind::Segments,
            &segment.key.clone(),
            StoreItem::Segment(segment),
        );
    }
}

impl Store for MockStore {
    fn init(&self, data: crate::store::AllData) {
        self.inner.init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        self.inner.get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.inner.all(kind)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreItem {
        self.inner.upsert(kind, key, item)
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }
}

pub struct NullSource;

impl Source for NullSource {
    type Error = Infallible;
    type Stream = futures::stream::Pending<Result<Message, Self::Error>>;

    fn stream(&self) -> Self::Stream {
        futures::stream::pending()
    }
}

/// An event sender that keeps every posted event for assertions.
#[derive(Default)]
pub struct CapturingSender {
    events: Mutex<Vec<Value>>,
    diagnostics: Mutex<Vec<Value>>,
}

impl CapturingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All analytics events sent so far, flattened across batches.
    pub fn events(&self) -> Vec<Value> {
        self.events.lock().clone()
    }

    pub fn diagnostics(&self) -> Vec<Value> {
        self.diagnostics.lock().clone()
    }

    pub fn events_of_kind(&self, kind: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event["kind"] == kind)
            .collect()
    }
}

#[async_trait]
impl EventSender for CapturingSender {
    async fn send_events(&self, events: Vec<crate::events::OutputEvent>) -> EventSenderResult {
        let mut raw = serde_json::to_value(&events)
            .ok()
            .and_then(|value| match value {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .unwrap_or_default();
        self.events.lock().append(&mut raw);
        EventSenderResult::Success { server_time: None }
    }

    async fn send_diagnostic(&self, event: Value) {
        self.diagnostics.lock().push(event);
    }
}

pub struct FlagBuilder(FeatureFlag);

impl Default for FlagBuilder {
    fn default() -> Self {
        Self(FeatureFlag {
            key: "my_test_flag".into(),
            version: 1,
            on: true,
            salt: "test-salt".into(),
            off_variation: Some(0),
            fallthrough: VariationOrRollout {
                variation: Some(0),
                ..VariationOrRollout::default()
            },
            variations: vec![false.into(), true.into()],
            ..FeatureFlag::default()
        })
    }
}

#[allow(dead_code)]
impl FlagBuilder {
    pub fn off(mut self) -> Self {
        self.0.on = false;
        self
    }

    pub fn on(mut self) -> Self {
        self.0.on = true;
        self
    }

    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.0.key = key.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.0.version = version;
        self
    }

    pub fn with_salt<K: Into<String>>(mut self, salt: K) -> Self {
        self.0.salt = salt.into();
        self
    }

    pub fn with_variations<I: IntoIterator<Item = V>, V: Into<Value>>(mut self, iter: I) -> Self {
        self.0.variations = iter.into_iter().map(|v| v.into()).collect();
        self
    }

    pub fn with_off_variation(mut self, index: Option<i64>) -> Self {
        self.0.off_variation = index;
        self
    }

    pub fn with_fallthrough_variation(mut self, index: i64) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: Some(index),
            rollout: None,
        };
        self
    }

    pub fn with_fallthrough_rollout<I: IntoIterator<Item = (i64, i64)>>(
        mut self,
        variations: I,
    ) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(rollout_of(variations, RolloutKind::Rollout)),
        };
        self
    }

    pub fn with_experiment_fallthrough<I: IntoIterator<Item = (i64, i64)>>(
        mut self,
        variations: I,
    ) -> Self {
        self.0.fallthrough = VariationOrRollout {
            variation: None,
            rollout: Some(rollout_of(variations, RolloutKind::Experiment)),
        };
        self
    }

    pub fn add_prerequisite<K: Into<String>>(mut self, key: K, variation: i64) -> Self {
        self.0.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
        });
        self
    }

    pub fn add_rule(mut self, rule: Rule) -> Self {
        self.0.rules.push(rule);
        self
    }

    pub fn with_track_events(mut self, track: bool) -> Self {
        self.0.track_events = track;
        self
    }

    pub fn with_track_events_fallthrough(mut self, track: bool) -> Self {
        self.0.track_events_fallthrough = track;
        self
    }

    pub fn with_debug_until(mut self, date: Option<u64>) -> Self {
        self.0.debug_events_until_date = date;
        self
    }

    pub fn with_client_side(mut self, client_side: bool) -> Self {
        self.0.client_side = client_side;
        self
    }

    pub fn clear_targets(mut self) -> Self {
        self.0.targets = Default::default();
        self
    }

    pub fn add_target<V: Into<String>>(mut self, variation: i64, value: V) -> Self {
        if let Some(target) = self
            .0
            .targets
            .iter_mut()
            .find(|t| t.variation == variation)
        {
            target.values.push(value.into());
        } else {
            self.0.targets.push(Target {
                variation,
                values: vec![value.into()],
            });
        }
        self
    }

    pub fn into_inner(self) -> FeatureFlag {
        self.0
    }
}

fn rollout_of<I: IntoIterator<Item = (i64, i64)>>(variations: I, kind: RolloutKind) -> Rollout {
    Rollout {
        kind,
        bucket_by: None,
        variations: variations
            .into_iter()
            .map(|(variation, weight)| WeightedVariation {
                variation,
                weight,
                untracked: false,
            })
            .collect(),
    }
}

pub fn clause<V: Into<Value>>(attribute: &str, op: Op, values: Vec<V>) -> Clause {
    Clause {
        attribute: attribute.into(),
        op,
        values: values.into_iter().map(|v| v.into()).collect(),
        negate: false,
    }
}

pub fn negated(mut clause: Clause) -> Clause {
    clause.negate = true;
    clause
}

pub fn segment_match_clause(keys: Vec<&str>) -> Clause {
    clause("", Op::SegmentMatch, keys)
}

pub fn rule_with_variation(id: &str, clauses: Vec<Clause>, variation: i64) -> Rule {
    Rule {
        id: id.into(),
        clauses,
        variation_or_rollout: VariationOrRollout {
            variation: Some(variation),
            rollout: None,
        },
        track_events: false,
    }
}

pub struct SegmentBuilder(Segment);

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self(Segment {
            key: "my_test_segment".into(),
            version: 1,
            salt: "test-salt".into(),
            ..Segment::default()
        })
    }
}

#[allow(dead_code)]
impl SegmentBuilder {
    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.0.key = key.into();
        self
    }

    pub fn include<K: Into<String>>(mut self, key: K) -> Self {
        self.0.included.push(key.into());
        self
    }

    pub fn exclude<K: Into<String>>(mut self, key: K) -> Self {
        self.0.excluded.push(key.into());
        self
    }

    pub fn add_rule(mut self, clauses: Vec<Clause>, weight: Option<i64>) -> Self {
        self.0.rules.push(SegmentRule {
            clauses,
            weight,
            bucket_by: None,
        });
        self
    }

    pub fn unbounded(mut self, generation: Option<i64>) -> Self {
        self.0.unbounded = true;
        self.0.generation = generation;
        self
    }

    pub fn into_inner(self) -> Segment {
        self.0
    }
}
