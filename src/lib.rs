use self::{
    big_segments::BigSegmentStoreWrapper,
    consumer::{Consumer, DataSourceState, ReadError, ReadOptions},
    evaluator::{experimentation_track, EvalResult, Evaluate, Evaluator},
    events::{
        now_millis, CustomEvent, EventProcessor, EventsConfig, FeatureRequestEvent, IdentifyEvent,
        InputEvent,
    },
    models::FeatureFlag,
    sender::HttpEventSender,
    source::{CreateSourceError, PollingSource, Source, SseSource},
    store::{DataKind, MemoryStore, Store},
};
use hmac::{Hmac, Mac};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use sha2::Sha256;
use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod big_segments;
pub mod bucketing;
pub mod consumer;
pub mod evaluator;
pub mod events;
pub mod message;
pub mod models;
pub mod operators;
pub mod persistent;
pub mod sender;
pub mod source;
pub mod store;
pub mod user;
#[cfg(test)]
mod test_utils;

pub use big_segments::BigSegmentsConfig;
pub use evaluator::{Detail, ErrorKind, Reason};
pub use user::User;

pub(crate) const USER_AGENT: &str = concat!("RustServerClient/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Already started, can't start multiple times")]
    AlreadyStarted,

    #[error("Timed out waiting for the first full data set")]
    Timeout,

    #[error("Failed to start reading from source: {0}")]
    Start(#[from] ReadError),
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("Invalid update source configuration: {0}")]
    InvalidSource(#[from] CreateSourceError),

    #[error("Invalid events URL: {0}")]
    InvalidEventsUrl(#[from] http::uri::InvalidUri),
}

/// Everything tunable about the client.
///
/// The defaults talk to the production control plane with streaming
/// updates and analytics enabled.
#[derive(Clone)]
pub struct Config {
    pub stream_base_url: String,
    pub poll_base_url: String,
    pub events_base_url: String,
    /// No network at all: evaluation uses local data only and no events
    /// are recorded.
    pub offline: bool,
    pub send_events: bool,
    pub poll_interval: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// How long [DefaultClient::start] waits for the first full data set.
    pub start_wait: Duration,
    pub events: EventsConfig,
    pub big_segments: Option<BigSegmentsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_base_url: source::DEFAULT_STREAM_BASE_URL.into(),
            poll_base_url: source::DEFAULT_POLL_BASE_URL.into(),
            events_base_url: "https://events.launchdarkly.com".into(),
            offline: false,
            send_events: true,
            poll_interval: Duration::from_secs(30),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            start_wait: Duration::from_secs(10),
            events: EventsConfig::default(),
            big_segments: None,
        }
    }
}

/// Client providing the idiomatic way of retrieving
/// variation values for flags.
///
/// Glue code on top of the smaller building blocks.
pub struct DefaultClient<ST, SRC> {
    sdk_key: String,
    config: Config,
    store: Arc<ST>,
    evaluator: Evaluator<Arc<ST>>,
    source: Option<SRC>,
    events: Option<EventProcessor>,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
    shutdown: CancellationToken,
    status_tx: Option<watch::Sender<DataSourceState>>,
    status_rx: watch::Receiver<DataSourceState>,
}

impl DefaultClient<MemoryStore, SseSource> {
    /// Create a feature flagging client based on an SDK token.
    ///
    /// Must be called from within the async runtime.
    pub fn with_token<T: Into<String>>(token: T) -> Result<Self, CreateError> {
        Self::streaming(token, Config::default())
    }

    /// A client fed by the streaming update protocol.
    pub fn streaming<T: Into<String>>(token: T, config: Config) -> Result<Self, CreateError> {
        let sdk_key = token.into();
        let source = SseSource::new(&config.stream_base_url, &sdk_key)?;
        let events = analytics_events(&config, &sdk_key)?;
        Ok(Self::with_components(sdk_key, config, MemoryStore::new(), source).with_events(events))
    }
}

impl DefaultClient<MemoryStore, PollingSource> {
    /// A client that falls back to polling full snapshots.
    pub fn polling<T: Into<String>>(token: T, config: Config) -> Result<Self, CreateError> {
        let sdk_key = token.into();
        let source = PollingSource::new(&config.poll_base_url, &sdk_key, config.poll_interval)?;
        let events = analytics_events(&config, &sdk_key)?;
        Ok(Self::with_components(sdk_key, config, MemoryStore::new(), source).with_events(events))
    }
}

fn analytics_events(config: &Config, sdk_key: &str) -> Result<Option<EventProcessor>, CreateError> {
    if config.offline || !config.send_events {
        return Ok(None);
    }
    let sender = HttpEventSender::new(&config.events_base_url, sdk_key)?;
    Ok(Some(EventProcessor::new(
        config.events.clone(),
        Arc::new(sender),
        sdk_key,
    )))
}

impl<ST, SRC> DefaultClient<ST, SRC>
where
    ST: Store,
{
    /// Make a client with custom components
    pub fn new<STA: Into<Arc<ST>>>(store: STA, source: SRC) -> Self {
        Self::with_components(
            String::new(),
            Config {
                send_events: false,
                ..Config::default()
            },
            store,
            source,
        )
    }

    /// Full custom wiring: own key, config, store and update source.
    pub fn with_components<STA: Into<Arc<ST>>>(
        sdk_key: impl Into<String>,
        config: Config,
        store: STA,
        source: SRC,
    ) -> Self {
        let store = store.into();
        let big_segments = config.big_segments.clone().map(BigSegmentStoreWrapper::new);
        let evaluator = match &big_segments {
            Some(wrapper) => {
                Evaluator::with_big_segments(Arc::clone(&store), Arc::clone(wrapper))
            }
            None => Evaluator::new(Arc::clone(&store)),
        };
        let (status_tx, status_rx) = watch::channel(DataSourceState::Initializing);
        Self {
            sdk_key: sdk_key.into(),
            config,
            evaluator,
            store,
            source: Some(source),
            events: None,
            big_segments,
            shutdown: CancellationToken::new(),
            status_tx: Some(status_tx),
            status_rx,
        }
    }

    fn with_events(mut self, events: Option<EventProcessor>) -> Self {
        self.events = events;
        self
    }

    /// Swap in an event processor, e.g. one with a custom sender.
    pub fn with_event_processor(mut self, events: EventProcessor) -> Self {
        self.events = Some(events);
        self
    }

    /// Start consuming data in the client
    ///
    /// Resolves once the initial data has been read, or errs after
    /// `start_wait`; in the latter case updating continues in the
    /// background and evaluation works off whatever the store holds.
    pub async fn start(&mut self) -> Result<(), StartError>
    where
        ST: Send + Sync + 'static,
        SRC: Source + Send + 'static,
        SRC::Stream: Unpin + Send,
        SRC::Error: Send,
    {
        if self.config.offline {
            info!("offline mode, not connecting to an update source");
            return Ok(());
        }
        let source = self.source.take().ok_or(StartError::AlreadyStarted)?;
        let status = self.status_tx.take().ok_or(StartError::AlreadyStarted)?;
        let options = ReadOptions {
            initial_reconnect_delay: self.config.initial_reconnect_delay,
            max_reconnect_delay: self.config.max_reconnect_delay,
            shutdown: self.shutdown.child_token(),
            status,
        };
        let ready = Arc::clone(&self.store).read_from(source, options);
        match time::timeout(self.config.start_wait, ready).await {
            Ok(result) => result.map_err(StartError::Start),
            Err(_) => {
                warn!("timed out waiting for initial data, continuing in the background");
                Err(StartError::Timeout)
            }
        }
    }

    /// Whether a full data set has arrived (or no data is expected at
    /// all). Never blocks.
    pub fn initialized(&self) -> bool {
        self.config.offline || self.store.initialized()
    }

    /// Current state of the update processor.
    pub fn data_source_state(&self) -> DataSourceState {
        *self.status_rx.borrow()
    }

    /// Watch update-processor state transitions.
    pub fn data_source_states(&self) -> watch::Receiver<DataSourceState> {
        self.status_rx.clone()
    }

    pub fn bool_variation(&self, flag_key: &str, user: &User, default: bool) -> bool {
        let detail =
            self.evaluate_internal(flag_key, user, Value::Bool(default), Value::is_boolean, false);
        detail.value.as_ref().and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn bool_variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: bool,
    ) -> (bool, Detail) {
        let detail =
            self.evaluate_internal(flag_key, user, Value::Bool(default), Value::is_boolean, true);
        let value = detail.value.as_ref().and_then(Value::as_bool).unwrap_or(default);
        (value, detail)
    }

    pub fn int_variation(&self, flag_key: &str, user: &User, default: i64) -> i64 {
        let detail =
            self.evaluate_internal(flag_key, user, Value::from(default), is_integer, false);
        detail.value.as_ref().and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn int_variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: i64,
    ) -> (i64, Detail) {
        let detail = self.evaluate_internal(flag_key, user, Value::from(default), is_integer, true);
        let value = detail.value.as_ref().and_then(Value::as_i64).unwrap_or(default);
        (value, detail)
    }

    pub fn float_variation(&self, flag_key: &str, user: &User, default: f64) -> f64 {
        let detail =
            self.evaluate_internal(flag_key, user, Value::from(default), Value::is_number, false);
        detail.value.as_ref().and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn float_variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: f64,
    ) -> (f64, Detail) {
        let detail =
            self.evaluate_internal(flag_key, user, Value::from(default), Value::is_number, true);
        let value = detail.value.as_ref().and_then(Value::as_f64).unwrap_or(default);
        (value, detail)
    }

    pub fn string_variation(&self, flag_key: &str, user: &User, default: &str) -> String {
        let detail = self.evaluate_internal(
            flag_key,
            user,
            Value::from(default),
            Value::is_string,
            false,
        );
        detail
            .value
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn string_variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: &str,
    ) -> (String, Detail) {
        let detail =
            self.evaluate_internal(flag_key, user, Value::from(default), Value::is_string, true);
        let value = detail
            .value
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string();
        (value, detail)
    }

    pub fn json_variation(&self, flag_key: &str, user: &User, default: Value) -> Value {
        let detail = self.evaluate_internal(flag_key, user, default.clone(), any_value, false);
        detail.value.unwrap_or(default)
    }

    pub fn json_variation_detail(
        &self,
        flag_key: &str,
        user: &User,
        default: Value,
    ) -> (Value, Detail) {
        let detail = self.evaluate_internal(flag_key, user, default.clone(), any_value, true);
        let value = detail.value.clone().unwrap_or(default);
        (value, detail)
    }

    /// Evaluate every flag for one user.
    ///
    /// Emits no analytics events; a failed flag never poisons the rest of
    /// the batch.
    pub fn all_flags_state(&self, user: &User, options: FlagsStateOptions) -> AllFlagsState {
        if self.config.offline {
            warn!("all_flags_state is unavailable in offline mode");
            return AllFlagsState::invalid();
        }
        if !self.store.initialized() {
            warn!("all_flags_state called before initialization");
            return AllFlagsState::invalid();
        }
        if user.key.is_empty() {
            warn!("all_flags_state called without a user key");
            return AllFlagsState::invalid();
        }

        let mut flags = BTreeMap::new();
        for (key, item) in self.store.all(DataKind::Features) {
            let flag = match item.into_flag() {
                Some(flag) => flag,
                None => continue,
            };
            if options.client_side_only && !flag.client_side {
                continue;
            }
            let detail =
                match catch_unwind(AssertUnwindSafe(|| self.evaluator.evaluate_flag(&flag, user)))
                {
                    Ok(result) => result.detail,
                    Err(_) => {
                        error!(flag = %key, "evaluation panicked, excluding the flag's value");
                        Detail::error(ErrorKind::Exception)
                    }
                };

            let track = flag.track_events || experimentation_track(&flag, &detail.reason);
            let force_reason = experimentation_track(&flag, &detail.reason);
            let in_debug_window = flag
                .debug_events_until_date
                .map_or(false, |until| until > now_millis());
            let with_details =
                !options.details_only_for_tracked_flags || track || in_debug_window;
            let reason = if (options.with_reasons && with_details) || force_reason {
                Some(detail.reason_json())
            } else {
                None
            };
            flags.insert(
                key,
                FlagState {
                    value: detail.value,
                    variation: detail.variation_index,
                    version: with_details.then(|| flag.version),
                    reason,
                    track_events: track,
                    debug_events_until_date: flag.debug_events_until_date,
                },
            );
        }
        AllFlagsState { valid: true, flags }
    }

    /// Register a user with the control plane.
    pub fn identify(&self, user: &User) {
        if user.key.is_empty() {
            warn!("identify called without a user key");
            return;
        }
        if let Some(events) = &self.events {
            events.send(InputEvent::Identify(IdentifyEvent {
                creation_date: now_millis(),
                user: user.clone(),
            }));
        }
    }

    /// Record an application-defined event, optionally with a payload and
    /// a numeric metric.
    pub fn track(&self, key: &str, user: &User, data: Option<Value>, metric_value: Option<f64>) {
        if user.key.is_empty() {
            warn!("track called without a user key");
            return;
        }
        if let Some(events) = &self.events {
            events.send(InputEvent::Custom(CustomEvent {
                creation_date: now_millis(),
                key: key.to_string(),
                user: user.clone(),
                data,
                metric_value,
            }));
        }
    }

    /// Push buffered analytics out early.
    pub fn flush(&self) {
        if let Some(events) = &self.events {
            events.flush();
        }
    }

    /// Stop all background work: the update source, the big segment
    /// poller, and (after a final flush) the event pipeline.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(big_segments) = &self.big_segments {
            big_segments.close();
        }
        if let Some(events) = &self.events {
            events.close().await;
        }
    }

    /// HMAC-SHA256 of the user key under the SDK key, for the secure
    /// client-side mode. Empty when either key is missing.
    pub fn secure_mode_hash(&self, user: &User) -> String {
        if self.sdk_key.is_empty() || user.key.is_empty() {
            return String::new();
        }
        let mac = match Hmac::<Sha256>::new_from_slice(self.sdk_key.as_bytes()) {
            Ok(mut mac) => {
                mac.update(user.key.as_bytes());
                mac
            }
            Err(_) => return String::new(),
        };
        hex::encode(mac.finalize().into_bytes())
    }

    fn evaluate_internal(
        &self,
        flag_key: &str,
        user: &User,
        default: Value,
        type_check: fn(&Value) -> bool,
        with_reasons: bool,
    ) -> Detail {
        if user.key.is_empty() {
            warn!(flag = %flag_key, "cannot evaluate for a user without a key");
            return Detail::error(ErrorKind::UserNotSpecified);
        }

        let flag = self.store.flag(flag_key);
        let (mut detail, flag) = match flag {
            Some(flag) => {
                match catch_unwind(AssertUnwindSafe(|| self.evaluator.evaluate_flag(&flag, user)))
                {
                    Ok(result) => {
                        self.forward_prerequisite_events(&result, user);
                        (result.detail, Some(flag))
                    }
                    Err(_) => {
                        error!(flag = %flag_key, "evaluation panicked, serving the default");
                        (Detail::error(ErrorKind::Exception), Some(flag))
                    }
                }
            }
            None => {
                let error_kind = if self.store.initialized() {
                    ErrorKind::FlagNotFound
                } else {
                    ErrorKind::ClientNotReady
                };
                warn!(flag = %flag_key, ?error_kind, "flag unavailable, serving the default");
                (Detail::error(error_kind), None)
            }
        };

        if let Some(value) = &detail.value {
            if !type_check(value) {
                warn!(flag = %flag_key, "variation has the wrong type, serving the default");
                detail = Detail {
                    value: None,
                    variation_index: None,
                    reason: Reason::Error {
                        error_kind: ErrorKind::WrongType,
                    },
                    big_segments_status: detail.big_segments_status,
                };
            }
        }

        self.send_feature_event(flag_key, user, &detail, &default, flag.as_ref(), with_reasons);
        detail
    }

    /// Prerequisite events come first; the terminal event for the flag
    /// itself follows.
    fn forward_prerequisite_events(&self, result: &EvalResult, user: &User) {
        let events = match &self.events {
            Some(events) => events,
            None => return,
        };
        for prereq in &result.prerequisite_events {
            let reason = prereq
                .track_events
                .then(|| prereq.detail.reason_json());
            events.send(InputEvent::FeatureRequest(FeatureRequestEvent {
                creation_date: now_millis(),
                key: prereq.flag_key.clone(),
                user: user.clone(),
                value: prereq.detail.value.clone().unwrap_or(Value::Null),
                default: Value::Null,
                variation: prereq.detail.variation_index,
                version: Some(prereq.flag_version),
                prereq_of: Some(prereq.prereq_of.clone()),
                reason,
                track_events: prereq.track_events,
                debug_events_until_date: prereq.debug_events_until_date,
            }));
        }
    }

    fn send_feature_event(
        &self,
        flag_key: &str,
        user: &User,
        detail: &Detail,
        default: &Value,
        flag: Option<&FeatureFlag>,
        with_reasons: bool,
    ) {
        let events = match &self.events {
            Some(events) => events,
            None => return,
        };
        let (track_events, debug_events_until_date, version, force_reason) = match flag {
            Some(flag) => {
                let forced = experimentation_track(flag, &detail.reason);
                (
                    flag.track_events || forced,
                    flag.debug_events_until_date,
                    Some(flag.version),
                    forced,
                )
            }
            None => (false, None, None, false),
        };
        let reason = (with_reasons || force_reason).then(|| detail.reason_json());
        events.send(InputEvent::FeatureRequest(FeatureRequestEvent {
            creation_date: now_millis(),
            key: flag_key.to_string(),
            user: user.clone(),
            value: detail.value.clone().unwrap_or_else(|| default.clone()),
            default: default.clone(),
            variation: detail.variation_index,
            version,
            prereq_of: None,
            reason,
            track_events,
            debug_events_until_date,
        }));
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64() || value.is_u64()
}

fn any_value(_: &Value) -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl<ST, SRC> Evaluate for DefaultClient<ST, SRC>
where
    ST: Store,
{
    fn evaluate(&self, flag: &str, user: &User) -> EvalResult {
        self.evaluator.evaluate(flag, user)
    }
}

/// Options for [DefaultClient::all_flags_state].
#[derive(Clone, Copy, Debug, Default)]
pub struct FlagsStateOptions {
    pub with_reasons: bool,
    /// Only flags marked for client-side use.
    pub client_side_only: bool,
    /// Strip version/reason metadata from flags that are not tracked.
    pub details_only_for_tracked_flags: bool,
}

#[derive(Clone, Debug)]
struct FlagState {
    value: Option<Value>,
    variation: Option<usize>,
    version: Option<u64>,
    reason: Option<Value>,
    track_events: bool,
    debug_events_until_date: Option<u64>,
}

/// The state of every flag for one user, in the canonical bootstrap JSON
/// shape: flag values at the top level, metadata under `$flagsState`,
/// overall validity under `$valid`.
#[derive(Clone, Debug)]
pub struct AllFlagsState {
    valid: bool,
    flags: BTreeMap<String, FlagState>,
}

impl AllFlagsState {
    fn invalid() -> Self {
        Self {
            valid: false,
            flags: BTreeMap::new(),
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn value(&self, flag_key: &str) -> Option<&Value> {
        self.flags.get(flag_key).and_then(|state| state.value.as_ref())
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a Value>,
    #[serde(skip_serializing_if = "is_false")]
    track_events: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_events_until_date: Option<u64>,
}

impl Serialize for AllFlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.flags.len() + 2))?;
        for (key, state) in &self.flags {
            map.serialize_entry(key, &state.value)?;
        }
        let metadata: BTreeMap<&String, FlagMetadata<'_>> = self
            .flags
            .iter()
            .map(|(key, state)| {
                (
                    key,
                    FlagMetadata {
                        version: state.version,
                        variation: state.variation,
                        reason: state.reason.as_ref(),
                        track_events: state.track_events,
                        debug_events_until_date: state.debug_events_until_date,
                    },
                )
            })
            .collect();
        map.serialize_entry("$flagsState", &metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CapturingSender, FlagBuilder, MockStore, NullSource};
    use serde_json::json;

    fn client_with_events(
        store: MockStore,
    ) -> (
        DefaultClient<MockStore, NullSource>,
        Arc<CapturingSender>,
    ) {
        let sender = CapturingSender::new();
        let events = EventProcessor::new(
            EventsConfig::default(),
            Arc::clone(&sender) as Arc<dyn crate::sender::EventSender>,
            "sdk-key",
        );
        let client = DefaultClient::new(store, NullSource).with_event_processor(events);
        (client, sender)
    }

    #[tokio::test]
    async fn smoke() {
        let mut store = MockStore::new();
        let flag = FlagBuilder::default()
            .on()
            .with_key("smoke_flag")
            .add_target(1, "kalk.space")
            .add_target(1, "www.netlify.com")
            .into_inner();
        store.add(flag);

        let client = DefaultClient::new(store, NullSource);

        {
            let user = User::new("kalk.space");
            let result = client.bool_variation("smoke_flag", &user, false);
            assert!(result);
        }
        {
            let user = User::new("app.netlify.com");
            let result = client.bool_variation("smoke_flag", &user, true);
            assert!(!result);
        }
    }

    #[tokio::test]
    async fn wrong_type_serves_the_default_but_still_emits() {
        let mut store = MockStore::new();
        store.add(
            FlagBuilder::default()
                .off()
                .with_key("key")
                .with_variations(vec![json!("x"), json!("value2")])
                .with_off_variation(Some(1))
                .into_inner(),
        );
        let (client, sender) = client_with_events(store);

        let user = User::new("userkey");
        let (value, detail) = client.int_variation_detail("key", &user, 1);
        assert_eq!(value, 1);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::WrongType
            }
        );

        client.close().await;
        // the evaluation still reached the event pipeline
        let summaries = sender.events_of_kind("summary");
        assert_eq!(summaries.len(), 1);
        let counter = &summaries[0]["features"]["key"]["counters"][0];
        assert_eq!(counter["count"], json!(1));
        assert_eq!(counter["value"], json!(1));
        assert_eq!(sender.events_of_kind("index").len(), 1);
    }

    #[tokio::test]
    async fn unknown_flag_serves_the_default_and_emits_without_version() {
        let (client, sender) = client_with_events(MockStore::new());

        let user = User::new("userkey");
        let (value, detail) = client.string_variation_detail("ghost", &user, "fallback");
        assert_eq!(value, "fallback");
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::FlagNotFound
            }
        );

        client.close().await;
        let summaries = sender.events_of_kind("summary");
        let counter = &summaries[0]["features"]["ghost"]["counters"][0];
        assert_eq!(counter["unknown"], json!(true));
        assert!(counter.get("version").is_none());
        assert_eq!(summaries[0]["features"]["ghost"]["default"], json!("fallback"));
    }

    #[tokio::test]
    async fn uninitialized_store_reports_client_not_ready() {
        let client = DefaultClient::new(MockStore::uninitialized(), NullSource);
        assert!(!client.initialized());

        let (value, detail) = client.bool_variation_detail("any", &User::new("u"), true);
        assert!(value);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::ClientNotReady
            }
        );
    }

    #[tokio::test]
    async fn empty_user_key_emits_nothing() {
        let mut store = MockStore::new();
        store.add(FlagBuilder::default().with_key("key").into_inner());
        let (client, sender) = client_with_events(store);

        let (value, detail) = client.bool_variation_detail("key", &User::new(""), true);
        assert!(value);
        assert_eq!(
            detail.reason,
            Reason::Error {
                error_kind: ErrorKind::UserNotSpecified
            }
        );

        client.identify(&User::new(""));
        client.track("clicked", &User::new(""), None, None);
        client.close().await;
        assert!(sender.events().is_empty());
    }

    #[tokio::test]
    async fn prerequisite_events_precede_the_terminal_event() {
        let mut store = MockStore::new();
        store.add(
            FlagBuilder::default()
                .on()
                .with_key("a")
                .with_fallthrough_variation(1)
                .add_prerequisite("b", 0)
                .with_track_events(true)
                .into_inner(),
        );
        store.add(
            FlagBuilder::default()
                .on()
                .with_key("b")
                .with_fallthrough_variation(0)
                .with_track_events(true)
                .into_inner(),
        );
        let (client, sender) = client_with_events(store);

        assert!(client.bool_variation("a", &User::new("u"), false));
        client.close().await;

        let features = sender.events_of_kind("feature");
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["key"], json!("b"));
        assert_eq!(features[0]["prereqOf"], json!("a"));
        assert_eq!(features[1]["key"], json!("a"));
        assert!(features[1].get("prereqOf").is_none());
    }

    #[tokio::test]
    async fn all_flags_state_has_the_bootstrap_shape() {
        let mut store = MockStore::new();
        store.add(
            FlagBuilder::default()
                .on()
                .with_key("key1")
                .with_variations(vec![json!("value1")])
                .with_fallthrough_variation(0)
                .into_inner(),
        );
        store.add(
            FlagBuilder::default()
                .on()
                .with_key("key2")
                .with_variations(vec![json!("value2")])
                .with_fallthrough_variation(0)
                .into_inner(),
        );
        let client = DefaultClient::new(store, NullSource);

        let state = client.all_flags_state(&User::new("u"), FlagsStateOptions::default());
        assert!(state.valid());
        assert_eq!(state.value("key1"), Some(&json!("value1")));
        assert_eq!(
            serde_json::to_value(&state).expect("serialize"),
            json!({
                "key1": "value1",
                "key2": "value2",
                "$flagsState": {
                    "key1": {"version": 1, "variation": 0},
                    "key2": {"version": 1, "variation": 0},
                },
                "$valid": true,
            })
        );

        let with_reasons = client.all_flags_state(
            &User::new("u"),
            FlagsStateOptions {
                with_reasons: true,
                ..FlagsStateOptions::default()
            },
        );
        let raw = serde_json::to_value(&with_reasons).expect("serialize");
        assert_eq!(
            raw["$flagsState"]["key1"]["reason"],
            json!({"kind": "FALLTHROUGH"})
        );
    }

    #[tokio::test]
    async fn client_side_only_filters_flags() {
        let mut store = MockStore::new();
        store.add(
            FlagBuilder::default()
                .with_key("server-only")
                .with_client_side(false)
                .into_inner(),
        );
        store.add(
            FlagBuilder::default()
                .with_key("client-ok")
                .with_client_side(true)
                .into_inner(),
        );
        let client = DefaultClient::new(store, NullSource);

        let state = client.all_flags_state(
            &User::new("u"),
            FlagsStateOptions {
                client_side_only: true,
                ..FlagsStateOptions::default()
            },
        );
        assert!(state.value("client-ok").is_some());
        assert!(state.value("server-only").is_none());
    }

    #[tokio::test]
    async fn offline_mode_evaluates_locally_and_stays_quiet() {
        let mut store = MockStore::new();
        store.add(FlagBuilder::default().with_key("key").into_inner());
        let config = Config {
            offline: true,
            send_events: false,
            ..Config::default()
        };
        let mut client =
            DefaultClient::with_components("sdk-key", config, store, NullSource);

        // offline clients are initialized by definition and never connect
        client.start().await.expect("offline start");
        assert!(client.initialized());

        // local data still evaluates
        assert!(!client.bool_variation("key", &User::new("u"), true));

        // but bulk state reports itself invalid
        let state = client.all_flags_state(&User::new("u"), FlagsStateOptions::default());
        assert!(!state.valid());
        assert_eq!(
            serde_json::to_value(&state).expect("serialize"),
            json!({"$flagsState": {}, "$valid": false})
        );
    }

    #[tokio::test]
    async fn secure_mode_hash_matches_the_reference() {
        let client = DefaultClient::with_components(
            "secret",
            Config {
                send_events: false,
                ..Config::default()
            },
            MockStore::new(),
            NullSource,
        );
        assert_eq!(
            client.secure_mode_hash(&User::new("Message")),
            "aa747c502a898200f9e4fa21bac68136f886a0e27aec70ba06daf2e2a5cb5597"
        );
        assert_eq!(client.secure_mode_hash(&User::new("")), "");

        let keyless = DefaultClient::new(MockStore::new(), NullSource);
        assert_eq!(keyless.secure_mode_hash(&User::new("Message")), "");
    }

    #[tokio::test]
    async fn start_can_only_happen_once() {
        let mut client = DefaultClient::new(MockStore::new(), NullSource);
        let mut config = Config::default();
        config.start_wait = Duration::from_millis(10);
        client.config = config;

        // the null source never delivers, so the start times out
        assert!(matches!(client.start().await, Err(StartError::Timeout)));
        assert!(matches!(
            client.start().await,
            Err(StartError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn track_and_identify_reach_the_pipeline() {
        let (client, sender) = client_with_events(MockStore::new());

        client.identify(&User::new("u"));
        client.track("purchase", &User::new("u"), Some(json!({"sku": 7})), Some(10.0));
        client.close().await;

        assert_eq!(sender.events_of_kind("identify").len(), 1);
        let custom = sender.events_of_kind("custom");
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0]["key"], json!("purchase"));
    }
}
