//! Changefeed: one live query wrapped as an event-emitting object.
//!
//! ```text
//!   connect()                       backend
//!      │  query{changes: true} ──────►  │
//!      │                                │ initial rows ──► resolves connect()
//!      │                                │ delta ──┐
//!      ▼                                │ delta ──┼─► PendingQueue (until flushed)
//!  Connected ── next tick ── flush ─────┼─────────┘        │
//!                                       │                  ▼
//!                                       │ delta ─────► FeedEvent::Update
//!                                       │ error / query_cancel ─► close()
//! ```
//!
//! The first response resolves [`Changefeed::connect`]. Deltas that arrive
//! before the queue is flushed are buffered and replayed in arrival order on
//! the tick after connecting, so a delta racing the initial result is applied
//! exactly once and never ahead of the rows it modifies.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::events::{EventBus, Subscription};
use crate::protocol::{
    Change, Query, QueryBackend, QueryError, QueryRequest, QueryResponse, Record,
    DEFAULT_QUERY_TIMEOUT,
};

/// Connection lifecycle shared by changefeeds and tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connect attempt failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("can only connect when disconnected, but state is '{0}'")]
    NotDisconnected(ConnectionState),
    #[error("query was cancelled before the initial result")]
    Cancelled,
    #[error("initial result has no rows for table '{0}'")]
    MissingTable(String),
    #[error("changefeed closed while connecting")]
    ClosedWhileConnecting,
    #[error("initial query failed: {0}")]
    Query(#[from] QueryError),
}

/// Events emitted by a [`Changefeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Update(Change),
    Close,
}

type Incoming = Result<QueryResponse, QueryError>;

/// Deltas held back until the first flush after connecting.
#[derive(Debug)]
enum PendingQueue {
    Buffering(VecDeque<Incoming>),
    Flushed,
}

impl PendingQueue {
    fn new() -> Self {
        PendingQueue::Buffering(VecDeque::new())
    }

    /// Buffer `item`, or hand it back if the queue is already flushed.
    fn push(&mut self, item: Incoming) -> Option<Incoming> {
        match self {
            PendingQueue::Buffering(queue) => {
                queue.push_back(item);
                None
            }
            PendingQueue::Flushed => Some(item),
        }
    }

    /// Switch to pass-through, returning everything buffered so far.
    fn flush(&mut self) -> VecDeque<Incoming> {
        match std::mem::replace(self, PendingQueue::Flushed) {
            PendingQueue::Buffering(queue) => queue,
            PendingQueue::Flushed => VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        match self {
            PendingQueue::Buffering(queue) => queue.len(),
            PendingQueue::Flushed => 0,
        }
    }
}

struct FeedInner {
    state: ConnectionState,
    id: Option<String>,
    initial: Option<oneshot::Sender<Incoming>>,
    pending: PendingQueue,
}

struct FeedShared {
    backend: Arc<dyn QueryBackend>,
    query: Query,
    options: Vec<Value>,
    timeout: Duration,
    inner: Mutex<FeedInner>,
    events: EventBus<FeedEvent>,
}

/// A live query with explicit connection state. Cloning shares the feed.
#[derive(Clone)]
pub struct Changefeed {
    shared: Arc<FeedShared>,
}

impl fmt::Debug for Changefeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changefeed")
            .field("table", &self.shared.query.table())
            .field("state", &self.state())
            .finish()
    }
}

impl Changefeed {
    pub fn new(backend: Arc<dyn QueryBackend>, query: Query) -> Self {
        Self {
            shared: Arc::new(FeedShared {
                backend,
                query,
                options: Vec::new(),
                timeout: DEFAULT_QUERY_TIMEOUT,
                inner: Mutex::new(FeedInner {
                    state: ConnectionState::Disconnected,
                    id: None,
                    initial: None,
                    pending: PendingQueue::new(),
                }),
                events: EventBus::new(),
            }),
        }
    }

    /// Set the query timeout. Only meaningful before `connect`.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.rebuild(|shared| shared.timeout = timeout)
    }

    /// Extra protocol options passed with the query.
    pub fn with_options(self, options: Vec<Value>) -> Self {
        self.rebuild(|shared| shared.options = options)
    }

    fn rebuild(self, f: impl FnOnce(&mut FeedShared)) -> Self {
        match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                f(&mut shared);
                Self {
                    shared: Arc::new(shared),
                }
            }
            Err(shared) => Self { shared },
        }
    }

    pub fn table(&self) -> &str {
        self.shared.query.table()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Server-side id of the running query, once connected.
    pub fn id(&self) -> Option<String> {
        self.shared.lock().id.clone()
    }

    pub fn subscribe(&self) -> Subscription<FeedEvent> {
        self.shared.events.subscribe()
    }

    /// Number of deltas held back waiting for the first flush.
    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn ptr_eq(&self, other: &Changefeed) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Issue the query and wait for its initial rows.
    pub async fn connect(&self) -> Result<Vec<Record>, ConnectionError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut inner = self.shared.lock();
            if inner.state != ConnectionState::Disconnected {
                return Err(ConnectionError::NotDisconnected(inner.state));
            }
            inner.state = ConnectionState::Connecting;
            inner.initial = Some(first_tx);
        }

        let (sink, responses) = mpsc::unbounded_channel();
        let request = QueryRequest::changefeed(
            &self.shared.query,
            self.shared.timeout,
            self.shared.options.clone(),
        );
        self.shared.backend.query(request, sink);
        tokio::spawn(pump(Arc::downgrade(&self.shared), responses));

        let first = match first_rx.await {
            Ok(first) => first,
            Err(_) => {
                self.close();
                return Err(ConnectionError::ClosedWhileConnecting);
            }
        };
        let response = match first {
            Ok(response) => response,
            Err(err) => {
                self.close();
                return Err(err.into());
            }
        };
        if response.is_cancel() {
            self.close();
            return Err(ConnectionError::Cancelled);
        }
        let table = self.table().to_string();
        let Some(rows) = response.rows(&table) else {
            self.close();
            return Err(ConnectionError::MissingTable(table));
        };

        {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed {
                return Err(ConnectionError::ClosedWhileConnecting);
            }
            inner.id = response.id;
            inner.state = ConnectionState::Connected;
        }
        debug!("changefeed on '{}' connected with {} rows", table, rows.len());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            shared.flush_pending();
        });

        Ok(rows)
    }

    /// Close the feed. Safe to call any number of times.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        self.shared.close_locked(&mut inner);
    }
}

/// Forwards backend responses into the feed until either side goes away.
async fn pump(feed: Weak<FeedShared>, mut responses: mpsc::UnboundedReceiver<Incoming>) {
    while let Some(response) = responses.recv().await {
        let Some(shared) = feed.upgrade() else { return };
        if !shared.deliver(response) {
            return;
        }
    }
    if let Some(shared) = feed.upgrade() {
        let mut inner = shared.lock();
        if inner.state != ConnectionState::Closed {
            warn!("changefeed on '{}' lost its transport", shared.query.table());
            shared.close_locked(&mut inner);
        }
    }
}

impl FeedShared {
    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route one response. Returns false once the feed is closed.
    fn deliver(&self, response: Incoming) -> bool {
        let mut inner = self.lock();
        if let Some(first) = inner.initial.take() {
            let _ = first.send(response);
            return true;
        }
        match inner.state {
            ConnectionState::Closed => false,
            _ => match inner.pending.push(response) {
                None => true,
                Some(response) => self.process(&mut inner, response),
            },
        }
    }

    fn flush_pending(&self) {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return;
        }
        let queued = inner.pending.flush();
        if !queued.is_empty() {
            debug!(
                "changefeed on '{}' flushing {} early updates",
                self.query.table(),
                queued.len()
            );
        }
        for response in queued {
            if !self.process(&mut inner, response) {
                break;
            }
        }
    }

    /// Emit one delta while connected; errors and cancellation close the feed.
    fn process(&self, inner: &mut FeedInner, response: Incoming) -> bool {
        let response = match response {
            Ok(response) if response.is_cancel() => {
                debug!("changefeed on '{}' cancelled upstream", self.query.table());
                self.close_locked(inner);
                return false;
            }
            Ok(response) => response,
            Err(err) => {
                warn!("closing changefeed on '{}': {}", self.query.table(), err);
                self.close_locked(inner);
                return false;
            }
        };
        if let Some(change) = response.into_change() {
            self.events.emit(FeedEvent::Update(change));
        }
        true
    }

    fn close_locked(&self, inner: &mut FeedInner) {
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Closed;
        inner.initial = None;
        let dropped = inner.pending.flush().len();
        if dropped > 0 {
            debug!("discarding {dropped} buffered updates on close");
        }
        if let Some(id) = inner.id.take() {
            self.cancel_upstream(id);
        }
        self.events.emit(FeedEvent::Close);
        self.events.close();
    }

    fn cancel_upstream(&self, id: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime to cancel query {id}");
            return;
        };
        let backend = self.backend.clone();
        handle.spawn(async move {
            if let Err(err) = backend.query_cancel(&id).await {
                debug!("ignoring error cancelling query {id}: {err}");
            }
        });
    }
}
