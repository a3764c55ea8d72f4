use crate::{
    message::{InitData, Message, Update},
    models::FeatureFlag,
    source::{Source, SourceError},
    store::{AllData, DataKind, Store, StoreItem},
};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use rand::Rng;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Background task stopped before sending result")]
    TaskDropped,

    #[error("Update source failed permanently")]
    FatalSource,
}

/// Where the update processor currently stands, observable by the host
/// application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    /// No data received yet.
    Initializing,
    /// Connected and up to date.
    Valid,
    /// Temporarily disconnected; stored data remains in use.
    Interrupted,
    /// Permanently stopped, by shutdown or a fatal error.
    Off,
}

/// Represents the state of a [Consumer]
/// after consuming a message
pub enum InitState {
    Pending,
    Done,
}

/// Tuning and plumbing for [`Consumer::read_from`].
pub struct ReadOptions {
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub shutdown: CancellationToken,
    pub status: watch::Sender<DataSourceState>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            shutdown: CancellationToken::new(),
            status: watch::channel(DataSourceState::Initializing).0,
        }
    }
}

/// Exponential backoff with full jitter: each wait is drawn uniformly
/// from zero up to the current ceiling, and the ceiling doubles per
/// attempt until capped.
struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .checked_mul(2u32.saturating_pow(self.attempt))
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let millis = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// A Consumer reads messages from a source and persists them
///
/// Implemented for every [Store]; the blanket impl applies snapshots and
/// patches under the store's versioning rules.
pub trait Consumer {
    /// Process a single message coming from a [Source]
    ///
    /// Receives a shared reference only, so it stays portable and
    /// queries on stores can be made concurrently.
    fn consume(&self, msg: Message) -> InitState;

    /// Start reading messages from a stream and provide readiness
    /// signaling, reconnection with jittered backoff, and a status
    /// channel.
    ///
    /// The returned future resolves once the first full data set has been
    /// stored (or the source failed fatally). When not interested in
    /// readiness, just drop the returned future. This has no
    /// bad consequences.
    fn read_from<S>(
        self: Arc<Self>,
        source: S,
        opts: ReadOptions,
    ) -> BoxFuture<'static, Result<(), ReadError>>
    where
        Self: Send + Sync + 'static,
        S: Source + Send + 'static,
        S::Stream: Unpin + Send,
        S::Error: Send,
    {
        let (init_tx, mut init_rx) = watch::channel::<Option<Result<(), ReadError>>>(None);

        task::spawn(async move {
            let ReadOptions {
                initial_reconnect_delay,
                max_reconnect_delay,
                shutdown,
                status,
            } = opts;
            let mut backoff = Backoff::new(initial_reconnect_delay, max_reconnect_delay);

            loop {
                let mut stream = source.stream();
                loop {
                    let item = tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = status.send(DataSourceState::Off);
                            return;
                        }
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(msg)) => {
                            // connection is healthy again
                            backoff.reset();
                            match self.consume(msg) {
                                InitState::Done => {
                                    let _ = status.send(DataSourceState::Valid);
                                    let _ = init_tx.send(Some(Ok(())));
                                }
                                InitState::Pending => {}
                            }
                        }
                        Some(Err(error)) if error.is_fatal() => {
                            error!(%error, "update source failed permanently, giving up");
                            let _ = status.send(DataSourceState::Off);
                            let _ = init_tx.send(Some(Err(ReadError::FatalSource)));
                            return;
                        }
                        Some(Err(error)) => {
                            warn!(%error, "failed processing event, restarting stream");
                            let _ = status.send(DataSourceState::Interrupted);
                            break;
                        }
                        None => {
                            warn!("update stream ended, restarting");
                            let _ = status.send(DataSourceState::Interrupted);
                            break;
                        }
                    }
                }

                let delay = backoff.next_delay();
                debug!(?delay, "waiting before restarting the stream");
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = status.send(DataSourceState::Off);
                        return;
                    }
                    _ = time::sleep(delay) => {}
                }
            }
        });

        // future to wait for readiness
        async move {
            if init_rx.borrow().is_none() {
                init_rx
                    .changed()
                    .await
                    .map_err(|_| ReadError::TaskDropped)?;
            }
            // safe to unwrap: if it's still None at this point, it's a bug
            let res = init_rx.borrow().as_ref().cloned().unwrap();
            res
        }
        .boxed()
    }
}

impl<T: Store + ?Sized> Consumer for T {
    fn consume(&self, msg: Message) -> InitState {
        match msg {
            // initialize flag and segment data
            Message::Put(data) => {
                let payload = ordered_payload(data);
                self.init(payload);
                info!("received full data set");
            }
            // update a single record
            Message::Patch(Update::Flag {
                key,
                data: Some(flag),
                ..
            }) => {
                self.upsert(DataKind::Features, &key, StoreItem::Flag(flag));
            }
            Message::Patch(Update::Segment {
                key,
                data: Some(segment),
                ..
            }) => {
                self.upsert(DataKind::Segments, &key, StoreItem::Segment(segment));
            }
            // delete a record
            Message::Delete(Update::Flag {
                key,
                version: Some(version),
                ..
            }) => {
                self.upsert(DataKind::Features, &key, StoreItem::Tombstone(version));
            }
            Message::Delete(Update::Segment {
                key,
                version: Some(version),
                ..
            }) => {
                self.upsert(DataKind::Segments, &key, StoreItem::Tombstone(version));
            }
            msg => {
                warn!(
                    ?msg,
                    "unknown update, missing some info or not yet implemented"
                );
            }
        };
        if self.initialized() {
            InitState::Done
        } else {
            InitState::Pending
        }
    }
}

/// Order a full snapshot so that a store applying it entry by entry never
/// sees a dangling reference: segments first, then flags with
/// prerequisites ahead of their dependents.
fn ordered_payload(data: InitData) -> AllData {
    let InitData { flags, segments } = data;
    let mut segments: Vec<(String, StoreItem)> = segments
        .into_iter()
        .map(|(key, segment)| (key, StoreItem::Segment(segment)))
        .collect();
    segments.sort_by(|a, b| a.0.cmp(&b.0));

    vec![
        (DataKind::Segments, segments),
        (DataKind::Features, flags_in_dependency_order(flags)),
    ]
}

/// Kahn's topological sort over the prerequisite graph.
///
/// Flags caught in a prerequisite cycle cannot be ordered; they are
/// appended at the end and still stored, failing only when evaluated.
fn flags_in_dependency_order(mut flags: HashMap<String, FeatureFlag>) -> Vec<(String, StoreItem)> {
    // dependents[p] = flags that list p as a prerequisite
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    for (key, flag) in &flags {
        let known_prereqs = flag
            .prerequisites
            .iter()
            .filter(|p| flags.contains_key(&p.key))
            .map(|p| p.key.clone())
            .collect::<Vec<_>>();
        in_degree.insert(key.clone(), known_prereqs.len());
        for prereq in known_prereqs {
            dependents.entry(prereq).or_default().push(key.clone());
        }
    }

    let mut ready: VecDeque<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(key, _)| key.clone())
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(flags.len());
    while let Some(key) = ready.pop_front() {
        for dependent in dependents.remove(&key).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(&dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        order.push(key);
    }

    if order.len() < flags.len() {
        // leftovers form at least one cycle
        let mut cyclic: Vec<String> = flags
            .keys()
            .filter(|key| !order.contains(key))
            .cloned()
            .collect();
        cyclic.sort();
        warn!(
            flags = ?cyclic,
            "prerequisite cycle in flag data, storing the flags anyway"
        );
        order.extend(cyclic);
    }

    order
        .into_iter()
        .filter_map(|key| flags.remove(&key).map(|flag| (key, StoreItem::Flag(flag))))
        .collect()
}
