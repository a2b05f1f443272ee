//! SyncTable: an in-memory, reactive mirror of one query result.
//!
//! The mirror is seeded from the initial rows of a [`Changefeed`] and kept
//! current by its deltas. Rows are published as immutable snapshots
//! (`Arc<Rows>`); every real mutation installs a new `Arc`, so comparing
//! pointers tells whether anything changed, and re-applying a delta that is
//! already reflected leaves the snapshot untouched.
//!
//! Local writes are merged into the mirror optimistically, sent upstream
//! through the query protocol and held in a pending map until acknowledged.
//! Losing the changefeed marks the table disconnected and rejects every
//! pending write with [`TableError::Disconnected`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::changefeed::{Changefeed, ConnectionError, ConnectionState, FeedEvent};
use crate::config::SyncConfig;
use crate::events::{EventBus, Subscription};
use crate::protocol::{
    Action, Change, Query, QueryBackend, QueryError, QueryRequest, Record, TableSchema,
};

/// Mirror contents: primary key string to record.
pub type Rows = BTreeMap<String, Record>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TableError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("disconnected before the write was acknowledged")]
    Disconnected,
    #[error("table is closed")]
    Closed,
    #[error("record is missing primary key fields of table '{0}'")]
    MissingPrimaryKey(String),
    #[error("write rejected: {0}")]
    Rejected(QueryError),
}

/// Events emitted by a [`SyncTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    Connected,
    /// Keys of rows whose content changed.
    Change(Vec<String>),
    Disconnected,
    Closed,
}

type WriteAck = oneshot::Sender<Result<(), TableError>>;

#[derive(Default)]
struct PendingWrites {
    next_id: u64,
    waiting: HashMap<u64, WriteAck>,
}

struct TableShared {
    schema: TableSchema,
    query: Query,
    backend: Arc<dyn QueryBackend>,
    config: SyncConfig,
    state: watch::Sender<ConnectionState>,
    rows: watch::Sender<Arc<Rows>>,
    feed: Mutex<Option<Changefeed>>,
    writes: Mutex<PendingWrites>,
    events: EventBus<TableEvent>,
}

/// Reactive mirror of a server-side query. Cloning shares the table.
#[derive(Clone)]
pub struct SyncTable {
    shared: Arc<TableShared>,
}

impl std::fmt::Debug for SyncTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTable")
            .field("table", &self.shared.schema.name)
            .field("state", &self.state())
            .field("rows", &self.shared.rows.borrow().len())
            .finish()
    }
}

impl SyncTable {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        schema: TableSchema,
        query: Query,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (rows, _) = watch::channel(Arc::new(Rows::new()));
        Self {
            shared: Arc::new(TableShared {
                schema,
                query,
                backend,
                config,
                state,
                rows,
                feed: Mutex::new(None),
                writes: Mutex::new(PendingWrites::default()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.shared.schema
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> Subscription<TableEvent> {
        self.shared.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &SyncTable) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// The current snapshot of every row.
    pub fn get_table(&self) -> Arc<Rows> {
        self.shared.rows.borrow().clone()
    }

    /// The first row in key order, if any.
    pub fn get_one(&self) -> Option<Record> {
        self.shared.rows.borrow().values().next().cloned()
    }

    /// The row with the same primary key as `key`.
    pub fn get(&self, key: &Record) -> Option<Record> {
        let key = self.shared.schema.key_of(key)?;
        self.shared.rows.borrow().get(&key).cloned()
    }

    /// Writes waiting for acknowledgement.
    pub fn pending_writes(&self) -> usize {
        self.shared.lock_writes().waiting.len()
    }

    /// Open the changefeed and replace the mirror with its initial rows.
    ///
    /// Valid from `disconnected`, including after a lost changefeed.
    pub async fn connect(&self) -> Result<(), TableError> {
        let shared = &self.shared;
        let started = shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(match self.state() {
                ConnectionState::Closed => TableError::Closed,
                other => ConnectionError::NotDisconnected(other).into(),
            });
        }

        let feed = Changefeed::new(shared.backend.clone(), shared.query.clone())
            .with_timeout(shared.config.feed_timeout());
        let mut updates = feed.subscribe();
        *shared.lock_feed() = Some(feed.clone());

        let rows = match feed.connect().await {
            Ok(rows) => rows,
            Err(err) => {
                shared.forget_feed(&feed);
                shared.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                warn!("table '{}' failed to connect: {}", self.name(), err);
                return Err(err.into());
            }
        };
        if self.state() == ConnectionState::Closed {
            feed.close();
            return Err(TableError::Closed);
        }

        let mirror: Rows = rows
            .into_iter()
            .filter_map(|row| shared.schema.key_of(&row).map(|key| (key, row)))
            .collect();
        info!("table '{}' connected with {} rows", self.name(), mirror.len());
        shared.rows.send_replace(Arc::new(mirror));
        shared.state.send_replace(ConnectionState::Connected);
        shared.events.emit(TableEvent::Connected);

        let table = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = updates.recv().await {
                let Some(shared) = table.upgrade() else { return };
                match event {
                    FeedEvent::Update(change) => shared.apply_change(change),
                    FeedEvent::Close => {
                        shared.on_feed_closed(&feed);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    /// Wait until `predicate` holds for the rows, returning that snapshot.
    ///
    /// `None` waits forever. Fails with [`TableError::Closed`] if the table
    /// closes first.
    pub async fn wait<F>(&self, mut predicate: F, timeout: Option<Duration>) -> Result<Arc<Rows>, TableError>
    where
        F: FnMut(&Rows) -> bool,
    {
        let mut rows_rx = self.shared.rows.subscribe();
        let mut state_rx = self.shared.state.subscribe();
        let waiting = async move {
            loop {
                let rows = rows_rx.borrow_and_update().clone();
                if predicate(&rows) {
                    return Ok(rows);
                }
                if *state_rx.borrow_and_update() == ConnectionState::Closed {
                    return Err(TableError::Closed);
                }
                tokio::select! {
                    changed = rows_rx.changed() => changed.map_err(|_| TableError::Closed)?,
                    changed = state_rx.changed() => changed.map_err(|_| TableError::Closed)?,
                }
            }
        };
        with_timeout(timeout, waiting).await
    }

    /// Wait until the table is connected.
    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> Result<(), TableError> {
        let mut state_rx = self.shared.state.subscribe();
        let waiting = async move {
            let reached = *state_rx
                .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed))
                .await
                .map_err(|_| TableError::Closed)?;
            match reached {
                ConnectionState::Closed => Err(TableError::Closed),
                _ => Ok(()),
            }
        };
        with_timeout(timeout, waiting).await
    }

    /// Merge `record` into its row and send it upstream.
    ///
    /// Resolves once the data layer acknowledges the write. On failure the
    /// optimistic merge is rolled back.
    pub async fn set(&self, record: Record) -> Result<(), TableError> {
        self.write(record, None).await
    }

    /// Like [`set`](Self::set), but the data layer applies the write only
    /// while the stored row still has the fields of `expected`. A lost race
    /// fails with `TableError::Rejected(QueryError::Conflict(..))`.
    pub async fn set_if(&self, record: Record, expected: Record) -> Result<(), TableError> {
        self.write(record, Some(expected)).await
    }

    async fn write(&self, record: Record, expected: Option<Record>) -> Result<(), TableError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(TableError::Closed),
            _ => return Err(TableError::Disconnected),
        }
        let shared = &self.shared;
        let key = shared
            .schema
            .key_of(&record)
            .ok_or_else(|| TableError::MissingPrimaryKey(shared.schema.name.clone()))?;

        let previous = shared.rows.borrow().get(&key).cloned();
        if shared.merge_row(&key, &record) {
            shared.events.emit(TableEvent::Change(vec![key.clone()]));
        }
        let optimistic = shared.rows.borrow().get(&key).cloned();

        let (ack_tx, ack_rx) = oneshot::channel();
        let write_id = shared.register_write(ack_tx);
        let timeout = shared.config.write_timeout();
        let (sink, mut responses) = mpsc::unbounded_channel();
        let request = match expected {
            Some(expected) => QueryRequest::set_if(&shared.schema.name, record, expected, timeout),
            None => QueryRequest::set(&shared.schema.name, record, timeout),
        };
        shared.backend.query(request, sink);

        let table = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let outcome = match responses.recv().await {
                Some(Ok(_)) => Ok(()),
                Some(Err(QueryError::Disconnected)) | None => Err(TableError::Disconnected),
                Some(Err(err)) => Err(TableError::Rejected(err)),
            };
            if let Some(shared) = table.upgrade() {
                shared.resolve_write(write_id, outcome);
            }
        });

        let outcome = match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TableError::Disconnected),
            Err(_) => {
                shared.lock_writes().waiting.remove(&write_id);
                Err(TableError::Timeout(timeout))
            }
        };
        if let Err(err) = &outcome {
            debug!("write to '{}' failed: {}", shared.schema.name, err);
            shared.rollback(&key, previous, optimistic);
        }
        outcome
    }

    /// Close the table. Safe to call any number of times.
    pub fn close(&self) {
        let shared = &self.shared;
        let closing = shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if !closing {
            return;
        }
        let feed = shared.lock_feed().take();
        if let Some(feed) = feed {
            feed.close();
        }
        shared.fail_pending(TableError::Closed);
        shared.events.emit(TableEvent::Closed);
        shared.events.close();
        debug!("table '{}' closed", shared.schema.name);
    }
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, TableError>
where
    F: std::future::Future<Output = Result<T, TableError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TableError::Timeout(limit))?,
        None => fut.await,
    }
}

impl TableShared {
    fn lock_feed(&self) -> MutexGuard<'_, Option<Changefeed>> {
        self.feed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writes(&self) -> MutexGuard<'_, PendingWrites> {
        self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clear the feed slot if it still holds `feed`.
    fn forget_feed(&self, feed: &Changefeed) -> bool {
        let mut slot = self.lock_feed();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(feed)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn on_feed_closed(&self, feed: &Changefeed) {
        if !self.forget_feed(feed) {
            return;
        }
        let lost = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Disconnected;
                true
            }
        });
        if lost {
            warn!("table '{}' lost its changefeed", self.schema.name);
            self.fail_pending(TableError::Disconnected);
            self.events.emit(TableEvent::Disconnected);
        }
    }

    fn apply_change(&self, change: Change) {
        let Change {
            action,
            new_val,
            old_val,
        } = change;
        let changed = match action {
            Action::Delete => {
                let key = old_val
                    .as_ref()
                    .or(new_val.as_ref())
                    .and_then(|row| self.schema.key_of(row));
                match key {
                    Some(key) => self.replace_row(&key, None).then_some(key),
                    None => {
                        warn!("delete on '{}' without a primary key", self.schema.name);
                        None
                    }
                }
            }
            Action::Insert | Action::Update => {
                let Some(record) = new_val else { return };
                match self.schema.key_of(&record) {
                    Some(key) => self.merge_row(&key, &record).then_some(key),
                    None => {
                        warn!("{action:?} on '{}' without a primary key", self.schema.name);
                        None
                    }
                }
            }
        };
        if let Some(key) = changed {
            self.events.emit(TableEvent::Change(vec![key]));
        }
    }

    /// Merge `fields` into the row at `key`. Returns whether anything changed.
    fn merge_row(&self, key: &str, fields: &Record) -> bool {
        self.rows.send_if_modified(|rows| {
            let merged = match rows.get(key) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    for (field, value) in fields {
                        merged.insert(field.clone(), value.clone());
                    }
                    merged
                }
                None => fields.clone(),
            };
            if rows.get(key) == Some(&merged) {
                return false;
            }
            let mut next = Rows::clone(rows);
            next.insert(key.to_string(), merged);
            *rows = Arc::new(next);
            true
        })
    }

    /// Set or remove the row at `key`. Returns whether anything changed.
    fn replace_row(&self, key: &str, record: Option<Record>) -> bool {
        self.rows.send_if_modified(|rows| {
            if rows.get(key) == record.as_ref() {
                return false;
            }
            let mut next = Rows::clone(rows);
            match record {
                Some(record) => next.insert(key.to_string(), record),
                None => next.remove(key),
            };
            *rows = Arc::new(next);
            true
        })
    }

    /// Undo an optimistic merge unless something newer replaced it.
    fn rollback(&self, key: &str, previous: Option<Record>, optimistic: Option<Record>) {
        if *self.state.borrow() == ConnectionState::Closed {
            return;
        }
        let untouched = self.rows.borrow().get(key) == optimistic.as_ref();
        if untouched && self.replace_row(key, previous) {
            self.events.emit(TableEvent::Change(vec![key.to_string()]));
        }
    }

    fn register_write(&self, ack: WriteAck) -> u64 {
        let mut writes = self.lock_writes();
        let id = writes.next_id;
        writes.next_id += 1;
        writes.waiting.insert(id, ack);
        id
    }

    fn resolve_write(&self, id: u64, outcome: Result<(), TableError>) {
        let ack = self.lock_writes().waiting.remove(&id);
        if let Some(ack) = ack {
            let _ = ack.send(outcome);
        }
    }

    fn fail_pending(&self, err: TableError) {
        let waiting: Vec<WriteAck> = self.lock_writes().waiting.drain().map(|(_, ack)| ack).collect();
        if !waiting.is_empty() {
            warn!(
                "rejecting {} pending writes on '{}': {}",
                waiting.len(),
                self.schema.name,
                err
            );
        }
        for ack in waiting {
            let _ = ack.send(Err(err.clone()));
        }
    }
}
