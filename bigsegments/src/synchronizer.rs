//! Background synchronization protocol for big segment data.
//!
//! One worker task per environment pulls membership patches from the
//! upstream service and feeds them to the environment's store. A cycle is:
//! poll until caught up, open the event stream, poll once more to close the
//! race with stream establishment, mark the store synchronized, then block
//! on stream events. Any rejected patch or cleanly ended stream restarts
//! the cycle from polling; transport failures restart it after a fixed
//! delay; credential-class HTTP errors stop the worker for good.

use crate::patch::Patch;
use crate::store::{BigSegmentStore, StoreError, now_unix_millis};
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use reqwest_eventsource::{Event as SseEvent, EventSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use url::Url;

/// Path polled for patches generated after a cursor.
const REVISIONS_PATH: &str = "/sdk/big-segments/revisions";
/// Path of the live-update server-sent-event stream.
const STREAM_PATH: &str = "/big-segments";

/// Capacity of the update-notification channel. Once a slow consumer lets
/// it fill up, publishing blocks and patch consumption stalls with it;
/// backlog visibility is preferred over dropping notifications.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SynchronizerConfig {
    /// Base URI of the polling service.
    pub base_uri: String,
    /// Base URI of the streaming service.
    pub stream_uri: String,
    /// Environment credential sent in the `Authorization` header.
    pub sdk_key: String,
    /// Idle interval at which the synchronized timestamp is refreshed while
    /// the stream carries no traffic, so staleness detectors don't misfire.
    pub sync_interval: Duration,
    /// Fixed delay before restarting after a recoverable failure.
    pub retry_interval: Duration,
    /// Logs full poll and stream payloads at TRACE level when enabled.
    pub trace_logging: bool,
}

impl SynchronizerConfig {
    pub fn new(
        base_uri: impl Into<String>,
        stream_uri: impl Into<String>,
        sdk_key: impl Into<String>,
    ) -> Self {
        SynchronizerConfig {
            base_uri: base_uri.into(),
            stream_uri: stream_uri.into(),
            sdk_key: sdk_key.into(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            trace_logging: false,
        }
    }
}

/// Errors raised while synchronizing; see [`SyncError::is_unrecoverable`]
/// for how the supervising retry loop treats them.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    HttpStatus(StatusCode),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("malformed patch payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stream error: {0}")]
    Stream(String),
}

impl SyncError {
    /// An unrecoverable error means the credential or resource is invalid
    /// (e.g. 401/403/404); retrying cannot help, so the worker exits and
    /// big segments stay degraded for the environment until restart.
    /// Everything else (transport failures, 400/408/429, any 5xx, store
    /// errors, undecodable payloads) is retried after a fixed delay.
    fn is_unrecoverable(&self) -> bool {
        match self {
            SyncError::HttpStatus(status) => {
                status.is_client_error() && !matches!(status.as_u16(), 400 | 408 | 429)
            }
            SyncError::InvalidUri(_) => true,
            _ => false,
        }
    }
}

enum CycleEnd {
    /// The stream ended or delivered a stale patch; restart from polling
    /// immediately.
    Resync,
    /// The close signal was observed.
    Shutdown,
}

struct AppliedBatch {
    /// Keys of segments whose membership changed, in application order.
    segment_keys: Vec<String>,
    /// True when a stale patch stopped the batch early.
    rejected: bool,
}

/// Channels owned by the worker task once started.
struct WorkerChannels {
    updates_tx: mpsc::Sender<Vec<String>>,
    shutdown_rx: watch::Receiver<bool>,
}

struct SyncWorker {
    config: SynchronizerConfig,
    store: Arc<dyn BigSegmentStore>,
    client: reqwest::Client,
    poll_url: String,
    stream_url: String,
    started: AtomicBool,
    synced: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    channels: parking_lot::Mutex<Option<WorkerChannels>>,
}

/// Handle to a per-environment synchronization worker.
///
/// Cloneable; all clones share the same worker. The worker is not spawned
/// until [`start`] is called, typically lazily the first time the
/// environment's ordinary streamed data references a big segment.
///
/// [`start`]: Synchronizer::start
#[derive(Clone)]
pub struct Synchronizer {
    worker: Arc<SyncWorker>,
}

impl Synchronizer {
    /// Builds a synchronizer bound to a store. The returned receiver yields
    /// the affected segment keys after each applied patch batch; it closes
    /// when the worker stops (or on [`close`] if the worker never started).
    ///
    /// [`close`]: Synchronizer::close
    pub fn new(
        config: SynchronizerConfig,
        store: Arc<dyn BigSegmentStore>,
        client: reqwest::Client,
    ) -> (Self, mpsc::Receiver<Vec<String>>) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poll_url = format!("{}{REVISIONS_PATH}", config.base_uri.trim_end_matches('/'));
        let stream_url = format!("{}{STREAM_PATH}", config.stream_uri.trim_end_matches('/'));

        let worker = Arc::new(SyncWorker {
            config,
            store,
            client,
            poll_url,
            stream_url,
            started: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            shutdown_tx,
            channels: parking_lot::Mutex::new(Some(WorkerChannels {
                updates_tx,
                shutdown_rx,
            })),
        });

        (Synchronizer { worker }, updates_rx)
    }

    /// Launches the background worker. The first call spawns exactly one
    /// task; later calls are no-ops, so callers may invoke this from any
    /// code path that observes a big segment without coordination.
    pub fn start(&self) {
        if self.worker.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(channels) = self.worker.channels.lock().take() else {
            // close() won the race; stay stopped.
            return;
        };
        let worker = self.worker.clone();
        tokio::spawn(async move {
            worker.run(channels).await;
        });
    }

    /// True once at least one full catch-up cycle has completed and the
    /// store's synchronized timestamp has been written. Evaluation logic
    /// uses this to decide whether stored membership can be trusted at all.
    pub fn has_synced(&self) -> bool {
        self.worker.synced.load(Ordering::SeqCst)
    }

    /// Signals the worker to stop at its next checkpoint. Idempotent and
    /// non-blocking; an in-flight HTTP request is awaited, not preempted.
    pub fn close(&self) {
        let _ = self.worker.shutdown_tx.send(true);
        // If the worker never started, drop its channels now so the update
        // channel closes for any listener.
        self.worker.channels.lock().take();
    }
}

impl SyncWorker {
    async fn run(&self, mut channels: WorkerChannels) {
        tracing::debug!("Big segment synchronizer starting");
        loop {
            if *channels.shutdown_rx.borrow() {
                break;
            }
            match self.sync_cycle(&mut channels).await {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::Resync) => continue,
                Err(err) if err.is_unrecoverable() => {
                    tracing::error!(
                        error = %err,
                        "Unrecoverable synchronization error; big segment updates are disabled for this environment"
                    );
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        retry_secs = self.config.retry_interval.as_secs(),
                        "Synchronization failed; will retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                        _ = channels.shutdown_rx.changed() => break,
                    }
                }
            }
        }
        tracing::debug!("Big segment synchronizer stopped");
        // Dropping `channels` here closes the update channel.
    }

    async fn sync_cycle(&self, channels: &mut WorkerChannels) -> Result<CycleEnd, SyncError> {
        let updates_tx = channels.updates_tx.clone();
        let mut pending_keys = Vec::new();

        // Catch up: poll until the upstream reports no further revisions.
        // A rejected patch just forces another iteration from the stored
        // cursor.
        loop {
            if *channels.shutdown_rx.borrow() {
                return Ok(CycleEnd::Shutdown);
            }
            let patches = self.poll_revisions().await?;
            if patches.is_empty() {
                break;
            }
            let applied = self.apply_batch(&patches).await?;
            pending_keys.extend(applied.segment_keys);
        }

        let mut stream = self.connect_stream().await?;

        // Close the race: revisions issued between the last poll and the
        // stream being fully established.
        loop {
            if *channels.shutdown_rx.borrow() {
                return Ok(CycleEnd::Shutdown);
            }
            let patches = self.poll_revisions().await?;
            if patches.is_empty() {
                break;
            }
            let applied = self.apply_batch(&patches).await?;
            pending_keys.extend(applied.segment_keys);
        }

        self.store.set_synchronized_on(now_unix_millis()).await?;
        self.synced.store(true, Ordering::SeqCst);
        self.publish(&updates_tx, pending_keys).await;

        let mut refresh = tokio::time::interval(self.config.sync_interval);
        refresh.reset(); // intervals fire immediately otherwise

        loop {
            tokio::select! {
                _ = channels.shutdown_rx.changed() => {
                    stream.close();
                    return Ok(CycleEnd::Shutdown);
                }
                _ = refresh.tick() => {
                    self.store.set_synchronized_on(now_unix_millis()).await?;
                }
                event = stream.next() => match event {
                    None => return Ok(CycleEnd::Resync),
                    Some(Ok(SseEvent::Open)) => {}
                    Some(Ok(SseEvent::Message(message))) => {
                        if self.config.trace_logging {
                            tracing::trace!(data = %message.data, "Stream event received");
                        }
                        let patches: Vec<Patch> = serde_json::from_str(&message.data)?;
                        let applied = self.apply_batch(&patches).await?;
                        if applied.rejected {
                            // The store is behind upstream; leave the
                            // synchronized timestamp alone until the resync
                            // cycle completes.
                            self.publish(&updates_tx, applied.segment_keys).await;
                            stream.close();
                            return Ok(CycleEnd::Resync);
                        }
                        self.store.set_synchronized_on(now_unix_millis()).await?;
                        self.publish(&updates_tx, applied.segment_keys).await;
                    }
                    Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                        stream.close();
                        return Ok(CycleEnd::Resync);
                    }
                    Some(Err(err)) => {
                        stream.close();
                        return Err(stream_error(err));
                    }
                }
            }
        }
    }

    /// One poll request: `GET {base}/sdk/big-segments/revisions?after=<cursor>`,
    /// omitting `after` while no cursor is recorded. An empty array means
    /// the store is caught up.
    async fn poll_revisions(&self) -> Result<Vec<Patch>, SyncError> {
        let cursor = self.store.get_cursor().await?;
        let mut url =
            Url::parse(&self.poll_url).map_err(|err| SyncError::InvalidUri(err.to_string()))?;
        if !cursor.is_empty() {
            url.query_pairs_mut().append_pair("after", &cursor);
        }

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.config.sdk_key.as_str())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::HttpStatus(status));
        }

        let body = response.text().await?;
        if self.config.trace_logging {
            tracing::trace!(body = %body, "Poll response");
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Opens the server-sent-event stream and waits for it to be
    /// established before returning it.
    async fn connect_stream(&self) -> Result<EventSource, SyncError> {
        let request = self
            .client
            .get(&self.stream_url)
            .header(AUTHORIZATION, self.config.sdk_key.as_str());
        let mut stream =
            EventSource::new(request).map_err(|err| SyncError::Stream(err.to_string()))?;

        match stream.next().await {
            Some(Ok(SseEvent::Open)) => {
                tracing::debug!("Big segment stream established");
                Ok(stream)
            }
            Some(Ok(SseEvent::Message(_))) => {
                Err(SyncError::Stream("event received before stream open".into()))
            }
            Some(Err(err)) => Err(stream_error(err)),
            None => Err(SyncError::Stream("stream closed before open".into())),
        }
    }

    /// Applies patches in delivery order, stopping at the first stale one.
    async fn apply_batch(&self, patches: &[Patch]) -> Result<AppliedBatch, SyncError> {
        let mut segment_keys = Vec::new();
        for patch in patches {
            if self.store.apply_patch(patch).await? {
                if !segment_keys.contains(&patch.segment_id) {
                    segment_keys.push(patch.segment_id.clone());
                }
            } else {
                tracing::warn!(
                    segment = %patch.segment_id,
                    version = %patch.version,
                    "Stale patch rejected; resynchronizing from the stored cursor"
                );
                return Ok(AppliedBatch {
                    segment_keys,
                    rejected: true,
                });
            }
        }
        Ok(AppliedBatch {
            segment_keys,
            rejected: false,
        })
    }

    async fn publish(&self, updates_tx: &mpsc::Sender<Vec<String>>, segment_keys: Vec<String>) {
        if segment_keys.is_empty() {
            return;
        }
        // Blocks once the buffer fills: a slow consumer stalls patch
        // consumption rather than losing notifications.
        if updates_tx.send(segment_keys).await.is_err() {
            tracing::debug!("Update channel closed; segment notifications dropped");
        }
    }
}

fn stream_error(err: reqwest_eventsource::Error) -> SyncError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => SyncError::HttpStatus(status),
        reqwest_eventsource::Error::Transport(err) => SyncError::Transport(err),
        other => SyncError::Stream(other.to_string()),
    }
}
