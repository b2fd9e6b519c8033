//! Test doubles: an in-memory big segment store and a scripted upstream
//! service exposing the poll endpoint and the event stream.

use crate::patch::Patch;
use crate::store::{BigSegmentStore, Result, UnixMillis};
use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// In-memory store with the same optimistic-concurrency contract as the
/// real backends, plus inspection helpers for assertions.
#[derive(Default)]
pub struct MemoryBigSegmentStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    cursor: String,
    included: HashMap<String, BTreeSet<String>>,
    excluded: HashMap<String, BTreeSet<String>>,
    synchronized_on: Option<UnixMillis>,
    sync_writes: usize,
}

impl MemoryBigSegmentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cursor(&self) -> String {
        self.state.lock().cursor.clone()
    }

    pub fn set_cursor(&self, cursor: &str) {
        self.state.lock().cursor = cursor.to_string();
    }

    pub fn included_segments(&self, user_key: &str) -> Vec<String> {
        self.state
            .lock()
            .included
            .get(user_key)
            .map(|segments| segments.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn excluded_segments(&self, user_key: &str) -> Vec<String> {
        self.state
            .lock()
            .excluded
            .get(user_key)
            .map(|segments| segments.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of times `set_synchronized_on` has been called.
    pub fn sync_write_count(&self) -> usize {
        self.state.lock().sync_writes
    }
}

#[async_trait]
impl BigSegmentStore for MemoryBigSegmentStore {
    async fn apply_patch(&self, patch: &Patch) -> Result<bool> {
        let mut state = self.state.lock();
        if state.cursor != patch.previous_version {
            return Ok(false);
        }
        for user_key in &patch.changes.included.add {
            state
                .included
                .entry(user_key.clone())
                .or_default()
                .insert(patch.segment_id.clone());
        }
        for user_key in &patch.changes.included.remove {
            if let Some(segments) = state.included.get_mut(user_key) {
                segments.remove(&patch.segment_id);
            }
        }
        for user_key in &patch.changes.excluded.add {
            state
                .excluded
                .entry(user_key.clone())
                .or_default()
                .insert(patch.segment_id.clone());
        }
        for user_key in &patch.changes.excluded.remove {
            if let Some(segments) = state.excluded.get_mut(user_key) {
                segments.remove(&patch.segment_id);
            }
        }
        state.cursor = patch.version.clone();
        Ok(true)
    }

    async fn get_cursor(&self) -> Result<String> {
        Ok(self.state.lock().cursor.clone())
    }

    async fn set_synchronized_on(&self, timestamp: UnixMillis) -> Result<()> {
        let mut state = self.state.lock();
        state.synchronized_on = Some(timestamp);
        state.sync_writes += 1;
        Ok(())
    }

    async fn get_synchronized_on(&self) -> Result<Option<UnixMillis>> {
        Ok(self.state.lock().synchronized_on)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct UpstreamState {
    poll_bodies: Mutex<VecDeque<String>>,
    poll_count: AtomicUsize,
    poll_status: AtomicU16,
    stream_connects: AtomicUsize,
    last_authorization: Mutex<Option<String>>,
    last_after: Mutex<Option<String>>,
    stream_senders: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

/// Scripted upstream: poll responses are dequeued per request (defaulting
/// to an empty array once the script runs out), and stream events are fed
/// to the most recent `/big-segments` connection.
#[derive(Clone)]
pub struct MockUpstream {
    base_uri: String,
    state: Arc<UpstreamState>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = Arc::new(UpstreamState {
            poll_status: AtomicU16::new(200),
            ..UpstreamState::default()
        });

        let app = Router::new()
            .route("/sdk/big-segments/revisions", get(poll_handler))
            .route("/big-segments", get(stream_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_uri = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockUpstream { base_uri, state }
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn enqueue_poll_body(&self, body: &str) {
        self.state.poll_bodies.lock().push_back(body.to_string());
    }

    pub fn set_poll_status(&self, status: u16) {
        self.state.poll_status.store(status, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> usize {
        self.state.poll_count.load(Ordering::SeqCst)
    }

    pub fn stream_connects(&self) -> usize {
        self.state.stream_connects.load(Ordering::SeqCst)
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().clone()
    }

    pub fn last_after(&self) -> Option<String> {
        self.state.last_after.lock().clone()
    }

    /// Sends one event payload on the most recent stream connection.
    pub fn send_stream_event(&self, data: &str) {
        let senders = self.state.stream_senders.lock();
        if let Some(sender) = senders.last() {
            let _ = sender.send(Event::default().data(data));
        }
    }

    /// Ends every open stream connection, as a server-side close would.
    pub fn close_streams(&self) {
        self.state.stream_senders.lock().clear();
    }
}

async fn poll_handler(
    State(state): State<Arc<UpstreamState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    state.poll_count.fetch_add(1, Ordering::SeqCst);
    *state.last_authorization.lock() = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    *state.last_after.lock() = params.get("after").cloned();

    let status = StatusCode::from_u16(state.poll_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = state
        .poll_bodies
        .lock()
        .pop_front()
        .unwrap_or_else(|| "[]".to_string());
    (status, body)
}

async fn stream_handler(
    State(state): State<Arc<UpstreamState>>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>> {
    state.stream_connects.fetch_add(1, Ordering::SeqCst);

    let (sender, receiver) = mpsc::unbounded_channel();
    state.stream_senders.lock().push(sender);

    let stream = futures::stream::unfold(receiver, |mut receiver| async move {
        receiver
            .recv()
            .await
            .map(|event| (Ok::<_, Infallible>(event), receiver))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
