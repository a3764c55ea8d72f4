//! Analytics event pipeline: enqueue, summarize, deduplicate users,
//! flush in the background.
//!
//! Emitting an event never blocks the caller. A dedicated dispatcher task
//! owns the buffer; batches leave through an [EventSender] on a small
//! worker pool.

use crate::sender::{EventSender, EventSenderResult};
use crate::user::User;
use lru::LruCache;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task, time,
};
use tracing::{debug, warn};
use uuid::Uuid;

const SEND_POOL_SIZE: u32 = 5;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// One flag evaluation, as reported by the client facade.
#[derive(Clone, Debug)]
pub struct FeatureRequestEvent {
    pub creation_date: u64,
    pub key: String,
    pub user: User,
    pub value: Value,
    pub default: Value,
    pub variation: Option<usize>,
    pub version: Option<u64>,
    /// Set when this evaluation happened as a prerequisite of another
    /// flag.
    pub prereq_of: Option<String>,
    pub reason: Option<Value>,
    /// Whether this event ships individually instead of only counting
    /// into the summary.
    pub track_events: bool,
    pub debug_events_until_date: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct IdentifyEvent {
    pub creation_date: u64,
    pub user: User,
}

#[derive(Clone, Debug)]
pub struct CustomEvent {
    pub creation_date: u64,
    pub key: String,
    pub user: User,
    pub data: Option<Value>,
    pub metric_value: Option<f64>,
}

#[derive(Clone, Debug)]
pub enum InputEvent {
    FeatureRequest(FeatureRequestEvent),
    Identify(IdentifyEvent),
    Custom(CustomEvent),
}

impl InputEvent {
    fn user(&self) -> &User {
        match self {
            InputEvent::FeatureRequest(e) => &e.user,
            InputEvent::Identify(e) => &e.user,
            InputEvent::Custom(e) => &e.user,
        }
    }

    fn creation_date(&self) -> u64 {
        match self {
            InputEvent::FeatureRequest(e) => e.creation_date,
            InputEvent::Identify(e) => e.creation_date,
            InputEvent::Custom(e) => e.creation_date,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventsConfig {
    /// Upper bound for buffered events; overflow is dropped, not blocked
    /// on.
    pub capacity: usize,
    pub flush_interval: Duration,
    pub user_keys_capacity: NonZeroUsize,
    pub user_keys_flush_interval: Duration,
    /// Attach the full user to every event instead of emitting index
    /// events.
    pub inline_users_in_events: bool,
    pub diagnostic_recording_interval: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            user_keys_capacity: NonZeroUsize::new(1000).unwrap(),
            user_keys_flush_interval: Duration::from_secs(300),
            inline_users_in_events: false,
            diagnostic_recording_interval: Duration::from_secs(900),
        }
    }
}

/// Events in the shape the control plane accepts.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind")]
pub enum OutputEvent {
    #[serde(rename = "feature")]
    Feature(FeatureBody),
    #[serde(rename = "debug")]
    Debug(FeatureBody),
    #[serde(rename = "index")]
    Index(IndexBody),
    #[serde(rename = "identify")]
    Identify(IdentifyBody),
    #[serde(rename = "custom")]
    Custom(CustomBody),
    #[serde(rename = "summary")]
    Summary(SummaryBody),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureBody {
    creation_date: u64,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    value: Value,
    default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    prereq_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBody {
    creation_date: u64,
    user: User,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyBody {
    creation_date: u64,
    key: String,
    user: User,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomBody {
    creation_date: u64,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric_value: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryBody {
    start_date: u64,
    end_date: u64,
    features: HashMap<String, SummaryFlag>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SummaryFlag {
    default: Value,
    counters: Vec<SummaryCounter>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SummaryCounter {
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    unknown: Option<bool>,
}

fn feature_body(event: &FeatureRequestEvent, inline_user: bool) -> FeatureBody {
    FeatureBody {
        creation_date: event.creation_date,
        key: event.key.clone(),
        user: inline_user.then(|| event.user.clone()),
        user_key: if inline_user {
            None
        } else {
            Some(event.user.key.clone())
        },
        version: event.version,
        variation: event.variation,
        value: event.value.clone(),
        default: event.default.clone(),
        prereq_of: event.prereq_of.clone(),
        reason: event.reason.clone(),
    }
}

/// Per-window aggregation of feature request events.
#[derive(Default)]
struct EventSummarizer {
    start_date: u64,
    end_date: u64,
    counters: HashMap<SummaryKey, SummaryState>,
    defaults: HashMap<String, Value>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SummaryKey {
    key: String,
    version: Option<u64>,
    variation: Option<usize>,
}

struct SummaryState {
    value: Value,
    count: u64,
}

impl EventSummarizer {
    fn add(&mut self, event: &FeatureRequestEvent) {
        if self.start_date == 0 || event.creation_date < self.start_date {
            self.start_date = event.creation_date;
        }
        if event.creation_date > self.end_date {
            self.end_date = event.creation_date;
        }
        self.defaults
            .insert(event.key.clone(), event.default.clone());
        let state = self
            .counters
            .entry(SummaryKey {
                key: event.key.clone(),
                version: event.version,
                variation: event.variation,
            })
            .or_insert_with(|| SummaryState {
                value: event.value.clone(),
                count: 0,
            });
        state.count += 1;
    }

    fn snapshot_and_reset(&mut self) -> Option<SummaryBody> {
        if self.counters.is_empty() {
            return None;
        }
        let mut features: HashMap<String, SummaryFlag> = HashMap::new();
        let defaults = &self.defaults;
        for (key, state) in self.counters.drain() {
            let flag = features
                .entry(key.key.clone())
                .or_insert_with(|| SummaryFlag {
                    default: defaults.get(&key.key).cloned().unwrap_or(Value::Null),
                    counters: Vec::new(),
                });
            flag.counters.push(SummaryCounter {
                value: state.value,
                version: key.version,
                variation: key.variation,
                count: state.count,
                // evaluations of flags missing from the store have no
                // version to report
                unknown: if key.version.is_none() {
                    Some(true)
                } else {
                    None
                },
            });
        }
        let body = SummaryBody {
            start_date: self.start_date,
            end_date: self.end_date,
            features,
        };
        self.defaults.clear();
        self.start_date = 0;
        self.end_date = 0;
        Some(body)
    }
}

#[derive(Default)]
struct EventStats {
    dropped: AtomicU64,
    deduped_users: AtomicU64,
    capacity_warned: AtomicBool,
}

enum DispatchMessage {
    Event(InputEvent),
    Flush,
    Close(oneshot::Sender<()>),
}

/// Handle for emitting analytics events.
///
/// Cloneable and cheap; all real work happens on the dispatcher task.
#[derive(Clone)]
pub struct EventProcessor {
    tx: mpsc::Sender<DispatchMessage>,
    stats: Arc<EventStats>,
}

impl EventProcessor {
    /// Spawn the dispatcher. Must be called from within the async
    /// runtime.
    pub fn new(config: EventsConfig, sender: Arc<dyn EventSender>, sdk_key: &str) -> Self {
        let stats = Arc::new(EventStats::default());
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let dispatcher = Dispatcher::new(config, sender, Arc::clone(&stats), rx, sdk_key);
        task::spawn(dispatcher.run());
        Self { tx, stats }
    }

    /// Enqueue without blocking; overflow drops the event.
    pub fn send(&self, event: InputEvent) {
        if self.tx.try_send(DispatchMessage::Event(event)).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.stats.capacity_warned.swap(true, Ordering::Relaxed) {
                warn!("event queue is full, dropping events until the next flush");
            }
        }
    }

    /// Ask for an early flush of everything buffered so far.
    pub fn flush(&self) {
        let _ = self.tx.try_send(DispatchMessage::Flush);
    }

    /// Flush, wait briefly for in-flight deliveries, and stop the
    /// dispatcher.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(DispatchMessage::Close(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Dispatcher {
    config: EventsConfig,
    sender: Arc<dyn EventSender>,
    stats: Arc<EventStats>,
    rx: mpsc::Receiver<DispatchMessage>,
    outbox: Vec<OutputEvent>,
    summary: EventSummarizer,
    user_keys: LruCache<String, ()>,
    send_slots: Arc<Semaphore>,
    sending_disabled: Arc<AtomicBool>,
    last_known_server_time: Arc<AtomicU64>,
    diagnostics: DiagnosticsManager,
    events_in_last_batch: usize,
}

impl Dispatcher {
    fn new(
        config: EventsConfig,
        sender: Arc<dyn EventSender>,
        stats: Arc<EventStats>,
        rx: mpsc::Receiver<DispatchMessage>,
        sdk_key: &str,
    ) -> Self {
        let user_keys = LruCache::new(config.user_keys_capacity);
        Self {
            diagnostics: DiagnosticsManager::new(sdk_key),
            config,
            sender,
            stats,
            rx,
            outbox: Vec::new(),
            summary: EventSummarizer::default(),
            user_keys,
            send_slots: Arc::new(Semaphore::new(SEND_POOL_SIZE as usize)),
            sending_disabled: Arc::new(AtomicBool::new(false)),
            last_known_server_time: Arc::new(AtomicU64::new(0)),
            events_in_last_batch: 0,
        }
    }

    async fn run(mut self) {
        let start = time::Instant::now();
        let mut flush_ticker = time::interval_at(
            start + self.config.flush_interval,
            self.config.flush_interval,
        );
        let mut users_ticker = time::interval_at(
            start + self.config.user_keys_flush_interval,
            self.config.user_keys_flush_interval,
        );
        let mut diagnostic_ticker = time::interval_at(
            start + self.config.diagnostic_recording_interval,
            self.config.diagnostic_recording_interval,
        );

        self.post_diagnostic(self.diagnostics.init_event(&self.config));

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(DispatchMessage::Event(event)) => self.process(event),
                    Some(DispatchMessage::Flush) => self.flush(),
                    Some(DispatchMessage::Close(done)) => {
                        self.flush();
                        self.drain().await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // every handle is gone
                        self.flush();
                        self.drain().await;
                        return;
                    }
                },
                _ = flush_ticker.tick() => self.flush(),
                _ = users_ticker.tick() => self.user_keys.clear(),
                _ = diagnostic_ticker.tick() => self.post_periodic_diagnostic(),
            }
        }
    }

    fn process(&mut self, event: InputEvent) {
        self.note_user(&event);
        match event {
            InputEvent::FeatureRequest(event) => {
                self.summary.add(&event);
                let debug = self.in_debug_window(&event);
                if event.track_events {
                    let body = feature_body(&event, self.config.inline_users_in_events);
                    self.push(OutputEvent::Feature(body));
                }
                if debug {
                    // debug events always carry the full user
                    self.push(OutputEvent::Debug(feature_body(&event, true)));
                }
            }
            InputEvent::Identify(event) => {
                self.push(OutputEvent::Identify(IdentifyBody {
                    creation_date: event.creation_date,
                    key: event.user.key.clone(),
                    user: event.user,
                }));
            }
            InputEvent::Custom(event) => {
                let inline = self.config.inline_users_in_events;
                self.push(OutputEvent::Custom(CustomBody {
                    creation_date: event.creation_date,
                    user: inline.then(|| event.user.clone()),
                    user_key: if inline { None } else { Some(event.user.key) },
                    key: event.key,
                    data: event.data,
                    metric_value: event.metric_value,
                }));
            }
        }
    }

    /// First sight of a user in the current window emits an index event.
    fn note_user(&mut self, event: &InputEvent) {
        let user = event.user();
        let is_identify = matches!(event, InputEvent::Identify(_));
        let seen = self.user_keys.get(&user.key).is_some();
        self.user_keys.put(user.key.clone(), ());
        if seen {
            if !is_identify {
                self.stats.deduped_users.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        // identify events already carry the user; inline mode never
        // indexes
        if !self.config.inline_users_in_events && !is_identify {
            let index = OutputEvent::Index(IndexBody {
                creation_date: event.creation_date(),
                user: user.clone(),
            });
            self.push(index);
        }
    }

    fn in_debug_window(&self, event: &FeatureRequestEvent) -> bool {
        match event.debug_events_until_date {
            None => false,
            Some(until) => {
                // respect the server clock when it is known to differ
                let server_time = self.last_known_server_time.load(Ordering::Relaxed);
                until > now_millis() && until > server_time
            }
        }
    }

    fn push(&mut self, event: OutputEvent) {
        if self.outbox.len() >= self.config.capacity {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.stats.capacity_warned.swap(true, Ordering::Relaxed) {
                warn!("event buffer is full, dropping events until the next flush");
            }
            return;
        }
        self.outbox.push(event);
    }

    fn flush(&mut self) {
        // the capacity warning fires once per flush window
        self.stats.capacity_warned.store(false, Ordering::Relaxed);

        let mut batch = std::mem::take(&mut self.outbox);
        if let Some(summary) = self.summary.snapshot_and_reset() {
            batch.push(OutputEvent::Summary(summary));
        }
        self.events_in_last_batch = batch.len();
        if batch.is_empty() {
            return;
        }
        if self.sending_disabled.load(Ordering::Relaxed) {
            debug!(count = batch.len(), "sending is disabled, discarding batch");
            return;
        }

        let sender = Arc::clone(&self.sender);
        let slots = Arc::clone(&self.send_slots);
        let disabled = Arc::clone(&self.sending_disabled);
        let server_time = Arc::clone(&self.last_known_server_time);
        task::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            match sender.send_events(batch).await {
                EventSenderResult::Success {
                    server_time: Some(time),
                } => {
                    server_time.store(time, Ordering::Relaxed);
                }
                EventSenderResult::Success { server_time: None } => {}
                EventSenderResult::TransientFailure => {}
                EventSenderResult::PermanentFailure => {
                    disabled.store(true, Ordering::Relaxed);
                }
            }
        });
    }

    /// Bounded wait for in-flight deliveries during shutdown.
    async fn drain(&self) {
        let slots = Arc::clone(&self.send_slots);
        let _ = time::timeout(
            SHUTDOWN_DRAIN_TIMEOUT,
            slots.acquire_many_owned(SEND_POOL_SIZE),
        )
        .await;
    }

    fn post_diagnostic(&self, event: Value) {
        if self.sending_disabled.load(Ordering::Relaxed) {
            return;
        }
        let sender = Arc::clone(&self.sender);
        task::spawn(async move {
            sender.send_diagnostic(event).await;
        });
    }

    fn post_periodic_diagnostic(&mut self) {
        let dropped = self.stats.dropped.swap(0, Ordering::Relaxed);
        let deduped = self.stats.deduped_users.swap(0, Ordering::Relaxed);
        let event =
            self.diagnostics
                .periodic_event(dropped, deduped, self.events_in_last_batch as u64);
        self.post_diagnostic(event);
    }
}

/// Identity and payload assembly for the diagnostic stream.
struct DiagnosticsManager {
    id: Value,
}

impl DiagnosticsManager {
    fn new(sdk_key: &str) -> Self {
        let suffix_start = sdk_key.len().saturating_sub(6);
        Self {
            id: json!({
                "diagnosticId": Uuid::new_v4().to_string(),
                "sdkKeySuffix": &sdk_key[suffix_start..],
            }),
        }
    }

    fn init_event(&self, config: &EventsConfig) -> Value {
        json!({
            "kind": "diagnostic-init",
            "creationDate": now_millis(),
            "id": self.id,
            "sdk": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "platform": {"name": "rust"},
            "configuration": {
                "eventsCapacity": config.capacity,
                "eventsFlushIntervalMillis": config.flush_interval.as_millis() as u64,
                "userKeysCapacity": config.user_keys_capacity.get(),
                "userKeysFlushIntervalMillis": config.user_keys_flush_interval.as_millis() as u64,
                "inlineUsersInEvents": config.inline_users_in_events,
                "diagnosticRecordingIntervalMillis":
                    config.diagnostic_recording_interval.as_millis() as u64,
            },
        })
    }

    fn periodic_event(&self, dropped: u64, deduped: u64, last_batch: u64) -> Value {
        json!({
            "kind": "diagnostic",
            "creationDate": now_millis(),
            "id": self.id,
            "droppedEvents": dropped,
            "deduplicatedUsers": deduped,
            "eventsInLastBatch": last_batch,
        })
    }
}
