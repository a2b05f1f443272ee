//! SyncDoc: a conflict-resolving document on top of a table of patches.
//!
//! ```text
//!   set_doc(new) ─► diff vs live ─► Patch{time, user_id} ─► patches table ─► upstream
//!                                                                │
//!   remote patch rows ◄──────────── changefeed ◄─────────────────┘
//!         │
//!         ▼
//!   PatchLog (ordered by (time, user_id)) ─► fold from nearest snapshot ─► live
//! ```
//!
//! Every replica folds the same ordered history, so replicas that have
//! seen the same patches hold the same content. Local commits are
//! serialized; a commit the data layer does not acknowledge is rolled back
//! and its error returned to the caller.
//!
//! State machine:
//! ```text
//!   Init ─► Ready ⇄ Syncing ─► Closed
//!     └───────┴────────┴─────► Error ─► Closed
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::changefeed::ConnectionState;
use crate::client::Client;
use crate::config::SyncConfig;
use crate::document::{DocType, DocTypeSpec, Document, DocumentError};
use crate::events::{EventBus, Subscription};
use crate::patch::{Patch, PatchId, PatchLog, Timestamp};
use crate::protocol::{Query, QueryError, Record};
use crate::schema;
use crate::table::{SyncTable, TableError, TableEvent};

/// Conditional writes tried before giving up on joining the users list.
const MAX_REGISTER_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocState {
    Init,
    Ready,
    Syncing,
    Closed,
    Error,
}

impl fmt::Display for DocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocState::Init => "init",
            DocState::Ready => "ready",
            DocState::Syncing => "syncing",
            DocState::Closed => "closed",
            DocState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    Ready,
    /// The live content changed, locally or remotely.
    Change,
    Saved,
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DocError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("document is not ready (state '{0}')")]
    NotReady(DocState),
    #[error("document is closed")]
    Closed,
    #[error("document failed: {0}")]
    Failed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("i/o error on '{path}': {message}")]
    Io { path: String, message: String },
    #[error("malformed patch row: {0}")]
    MalformedPatch(String),
}

/// How to open a document.
#[derive(Debug, Clone)]
pub struct DocOptions<O> {
    pub path: String,
    /// Defaults to an id derived from the project and path.
    pub string_id: Option<String>,
    pub config: SyncConfig,
    pub document: O,
    /// Seed an empty history from the file on disk.
    pub load_from_disk: bool,
}

impl<O: Default> DocOptions<O> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            string_id: None,
            config: SyncConfig::default(),
            document: O::default(),
            load_from_disk: true,
        }
    }
}

impl<O> DocOptions<O> {
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_document(mut self, document: O) -> Self {
        self.document = document;
        self
    }

    pub fn with_string_id(mut self, string_id: impl Into<String>) -> Self {
        self.string_id = Some(string_id.into());
        self
    }

    pub fn without_disk(mut self) -> Self {
        self.load_from_disk = false;
        self
    }
}

impl<O: DeserializeOwned + Default> DocOptions<O> {
    /// Options for `path` from a doctype's `opts` object.
    ///
    /// Engine settings and content options are both read from `opts`;
    /// whatever is missing keeps its default.
    pub fn from_opts(path: impl Into<String>, opts: &Record) -> Result<Self, DocumentError> {
        let value = Value::Object(opts.clone());
        let config: SyncConfig = serde_json::from_value(value.clone())
            .map_err(|err| DocumentError::InvalidOptions(err.to_string()))?;
        let document: O = serde_json::from_value(value)
            .map_err(|err| DocumentError::InvalidOptions(err.to_string()))?;
        Ok(Self::new(path).with_config(config).with_document(document))
    }
}

struct DocInner<D: Document> {
    log: PatchLog<D::Patch>,
    live: D,
    user_id: Option<u32>,
    saved: Option<String>,
    failure: Option<String>,
}

struct DocShared<D: Document> {
    path: String,
    string_id: String,
    client: Arc<dyn Client>,
    config: SyncConfig,
    options: D::Options,
    load_from_disk: bool,
    syncstrings: SyncTable,
    patches: SyncTable,
    state: watch::Sender<DocState>,
    inner: Mutex<DocInner<D>>,
    commit: tokio::sync::Mutex<()>,
    events: EventBus<DocEvent>,
}

/// A synchronized document of content type `D`. Cloning shares it.
pub struct SyncDoc<D: Document> {
    shared: Arc<DocShared<D>>,
}

impl<D: Document> Clone for SyncDoc<D> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: Document> fmt::Debug for SyncDoc<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDoc")
            .field("path", &self.shared.path)
            .field("doctype", &D::DOCTYPE)
            .field("state", &self.state())
            .finish()
    }
}

impl<D: Document> SyncDoc<D> {
    /// Create the document and start initializing it in the background.
    ///
    /// Fails only if the options are unusable; everything that can go wrong
    /// later is reported through the `Error` state.
    pub fn new(client: Arc<dyn Client>, options: DocOptions<D::Options>) -> Result<Self, DocError> {
        D::validate(&options.document)?;
        if options.path.is_empty() {
            return Err(DocumentError::InvalidOptions("path must not be empty".into()).into());
        }
        let string_id = options
            .string_id
            .clone()
            .unwrap_or_else(|| schema::string_id(client.project_id(), &options.path));

        let backend = client.backend();
        let syncstrings = SyncTable::new(
            backend.clone(),
            schema::syncstrings(),
            Query::new(schema::SYNCSTRINGS).filter("string_id", string_id.clone()),
            options.config.clone(),
        );
        let patches = SyncTable::new(
            backend,
            schema::patches(),
            Query::new(schema::PATCHES).filter("string_id", string_id.clone()),
            options.config.clone(),
        );

        let (state, _) = watch::channel(DocState::Init);
        let live = D::empty(&options.document);
        let doc = Self {
            shared: Arc::new(DocShared {
                path: options.path,
                string_id,
                client,
                config: options.config,
                options: options.document,
                load_from_disk: options.load_from_disk,
                syncstrings,
                patches,
                state,
                inner: Mutex::new(DocInner {
                    log: PatchLog::new(),
                    live,
                    user_id: None,
                    saved: None,
                    failure: None,
                }),
                commit: tokio::sync::Mutex::new(()),
                events: EventBus::new(),
            }),
        };

        let init = doc.clone();
        tokio::spawn(async move {
            if let Err(err) = init.initialize().await {
                init.fail(format!("initialization failed: {err}"));
            }
        });
        Ok(doc)
    }
}

impl<D: Document> SyncDoc<D> {
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn string_id(&self) -> &str {
        &self.shared.string_id
    }

    pub fn doctype(&self) -> DocType {
        D::DOCTYPE
    }

    pub fn state(&self) -> DocState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> Subscription<DocEvent> {
        self.shared.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &SyncDoc<D>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// This client's index in the document's `users` list, once registered.
    pub fn user_id(&self) -> Option<u32> {
        self.lock().user_id
    }

    /// Current content.
    pub fn get_doc(&self) -> D {
        self.lock().live.clone()
    }

    pub fn to_str(&self) -> String {
        self.lock().live.to_str()
    }

    /// Ids of every known patch, oldest first.
    pub fn versions(&self) -> Vec<PatchId> {
        self.lock().log.ids()
    }

    pub fn last_changed(&self) -> Option<Timestamp> {
        self.lock().log.latest().map(|id| id.time)
    }

    /// Content after every patch with `time <= t`.
    pub fn version(&self, t: Timestamp) -> Result<D, DocError> {
        let inner = self.lock();
        Ok(inner.log.content(&self.shared.options, Some(t))?)
    }

    pub fn has_unsaved_changes(&self) -> bool {
        let inner = self.lock();
        match &inner.saved {
            Some(saved) => *saved != inner.live.to_str(),
            None => !inner.log.is_empty(),
        }
    }

    /// Wait until initialization finished.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), DocError> {
        let mut state_rx = self.shared.state.subscribe();
        let waiting = async move {
            let reached = *state_rx
                .wait_for(|s| *s != DocState::Init)
                .await
                .map_err(|_| DocError::Closed)?;
            Ok::<DocState, DocError>(reached)
        };
        let reached = match timeout {
            Some(limit) => tokio::time::timeout(limit, waiting)
                .await
                .map_err(|_| DocError::Timeout(limit))??,
            None => waiting.await?,
        };
        match reached {
            DocState::Ready | DocState::Syncing => Ok(()),
            DocState::Closed => Err(DocError::Closed),
            _ => Err(self.failure()),
        }
    }

    /// Replace the content, committing the difference as one patch.
    ///
    /// Returns the new patch id, or `None` if nothing changed.
    pub async fn set_doc(&self, doc: D) -> Result<Option<PatchId>, DocError> {
        self.update(move |_| Ok(doc)).await
    }

    /// Commit the result of `edit` applied to the current content.
    ///
    /// `edit` runs against the content at commit time, so remote patches
    /// that arrived meanwhile are not undone.
    pub async fn update<F>(&self, edit: F) -> Result<Option<PatchId>, DocError>
    where
        F: FnOnce(&D) -> Result<D, DocError> + Send,
    {
        match self.state() {
            DocState::Ready | DocState::Syncing => {}
            DocState::Closed => return Err(DocError::Closed),
            DocState::Error => return Err(self.failure()),
            state => return Err(DocError::NotReady(state)),
        }
        self.commit(edit).await
    }

    /// Write the current content to the document's file.
    pub async fn save_to_disk(&self) -> Result<(), DocError> {
        self.ensure_open()?;
        let content = self.to_str();
        self.shared
            .client
            .write_file(&self.shared.path, &content)
            .await
            .map_err(|err| self.io_error(err))?;
        self.lock().saved = Some(content);
        self.shared.events.emit(DocEvent::Saved);
        debug!("saved '{}' to disk", self.shared.path);
        Ok(())
    }

    /// Replace the content with the file on disk.
    ///
    /// Returns whether anything changed; a missing file changes nothing.
    pub async fn load_from_disk(&self) -> Result<bool, DocError> {
        self.ensure_open()?;
        let Some(text) = self
            .shared
            .client
            .read_file(&self.shared.path)
            .await
            .map_err(|err| self.io_error(err))?
        else {
            return Ok(false);
        };
        let doc = D::from_str(&text, &self.shared.options)?;
        let committed = self.commit(move |_| Ok(doc)).await?;
        let mut inner = self.lock();
        inner.saved = Some(inner.live.to_str());
        Ok(committed.is_some())
    }

    /// Reopen tables that lost their changefeed.
    pub async fn reconnect(&self) -> Result<(), DocError> {
        self.ensure_open()?;
        for table in [&self.shared.syncstrings, &self.shared.patches] {
            if table.state() == ConnectionState::Disconnected {
                table.connect().await?;
            }
        }
        self.ingest_all();
        Ok(())
    }

    /// Release tables and listeners. Safe to call any number of times.
    pub fn close(&self) {
        let closing = self.shared.state.send_if_modified(|state| {
            if *state == DocState::Closed {
                false
            } else {
                *state = DocState::Closed;
                true
            }
        });
        if !closing {
            return;
        }
        self.shared.syncstrings.close();
        self.shared.patches.close();
        self.shared.events.emit(DocEvent::Closed);
        self.shared.events.close();
        info!("closed '{}'", self.shared.path);
    }

    fn lock(&self) -> MutexGuard<'_, DocInner<D>> {
        self.shared.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), DocError> {
        match self.state() {
            DocState::Closed => Err(DocError::Closed),
            DocState::Error => Err(self.failure()),
            _ => Ok(()),
        }
    }

    fn failure(&self) -> DocError {
        let message = self.lock().failure.clone();
        DocError::Failed(message.unwrap_or_else(|| "unknown failure".into()))
    }

    fn io_error(&self, err: std::io::Error) -> DocError {
        DocError::Io {
            path: self.shared.path.clone(),
            message: err.to_string(),
        }
    }

    /// Move to `to` if currently in `from`.
    fn transition(&self, from: DocState, to: DocState) {
        self.shared.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Enter the error state. Ignored once closed or already failed.
    fn fail(&self, message: String) {
        let failed = self.shared.state.send_if_modified(|state| match state {
            DocState::Closed | DocState::Error => false,
            _ => {
                *state = DocState::Error;
                true
            }
        });
        if failed {
            error!("'{}': {}", self.shared.path, message);
            self.lock().failure = Some(message.clone());
            self.shared.events.emit(DocEvent::Error(message));
        }
    }

    async fn initialize(&self) -> Result<(), DocError> {
        let shared = &self.shared;
        let syncstring_events = shared.syncstrings.subscribe();
        let patch_events = shared.patches.subscribe();

        let connecting = async {
            shared.syncstrings.connect().await?;
            shared.patches.connect().await?;
            Ok::<(), DocError>(())
        };
        match shared.config.init_timeout() {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| DocError::Timeout(limit))??,
            None => connecting.await?,
        }

        self.register_user().await?;
        self.ingest_all();
        if shared.load_from_disk && self.lock().log.is_empty() {
            match self.load_from_disk().await {
                Ok(true) => info!("seeded '{}' from disk", shared.path),
                Ok(false) => {}
                Err(err) => warn!("could not load '{}' from disk: {}", shared.path, err),
            }
        }

        if self.state() != DocState::Init {
            return Ok(());
        }
        self.transition(DocState::Init, DocState::Ready);
        shared.events.emit(DocEvent::Ready);
        info!(
            "'{}' ready with {} patches",
            shared.path,
            self.lock().log.len()
        );

        self.spawn_listener(patch_events, |doc, keys| doc.ingest_keys(keys));
        self.spawn_listener(syncstring_events, |doc, _| doc.check_syncstring());
        self.check_syncstring();
        Ok(())
    }

    fn spawn_listener(
        &self,
        mut events: Subscription<TableEvent>,
        on_change: fn(&SyncDoc<D>, &[String]),
    ) {
        let doc = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = doc.upgrade() else { return };
                let doc = SyncDoc { shared };
                match event {
                    TableEvent::Change(keys) => on_change(&doc, &keys),
                    TableEvent::Connected => doc.ingest_all(),
                    TableEvent::Disconnected => {
                        warn!("'{}' lost a changefeed, waiting for reconnect", doc.path())
                    }
                    TableEvent::Closed => {
                        doc.close();
                        return;
                    }
                }
            }
        });
    }

    /// Add this client to the `users` list and learn its user id.
    ///
    /// The list is written with a conditional set against the value it was
    /// read from, so two clients registering at once never share an index:
    /// the loser sees the winner's list and appends behind it.
    async fn register_user(&self) -> Result<(), DocError> {
        let shared = &self.shared;
        let me = Value::String(shared.client.client_id().to_string());
        for attempt in 0..MAX_REGISTER_ATTEMPTS {
            let existing = shared.syncstrings.get_one();
            let seen = users_of(existing.as_ref());
            let mut users: Vec<Value> = seen.as_array().cloned().unwrap_or_default();
            let user_id = match users.iter().position(|user| *user == me) {
                Some(index) => index,
                None => {
                    users.push(me.clone());
                    users.len() - 1
                }
            };

            let mut row = Record::new();
            row.insert("string_id".into(), shared.string_id.clone().into());
            row.insert("path".into(), shared.path.clone().into());
            row.insert("users".into(), Value::Array(users));
            row.insert(
                "last_active".into(),
                shared.client.server_time().as_millis().into(),
            );
            let has_doctype = existing.as_ref().is_some_and(|row| row.contains_key("doctype"));
            if !has_doctype {
                row.insert("doctype".into(), self.doctype_spec().to_json_string().into());
            }
            let mut expected = Record::new();
            expected.insert("users".into(), seen.clone());

            match shared.syncstrings.set_if(row, expected).await {
                Ok(()) => {
                    self.lock().user_id = Some(user_id as u32);
                    debug!("'{}' registered as user {}", shared.path, user_id);
                    return Ok(());
                }
                Err(TableError::Rejected(QueryError::Conflict(_))) => {
                    debug!(
                        "'{}' lost a users race (attempt {}), retrying",
                        shared.path,
                        attempt + 1
                    );
                    shared
                        .syncstrings
                        .wait(
                            |rows| users_of(rows.values().next()) != seen,
                            Some(shared.config.write_timeout()),
                        )
                        .await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(DocError::Failed(format!(
            "could not register in the users list of '{}'",
            shared.path
        )))
    }

    fn doctype_spec(&self) -> DocTypeSpec {
        let opts = match serde_json::to_value(&self.shared.options) {
            Ok(Value::Object(opts)) => opts,
            _ => Record::new(),
        };
        DocTypeSpec::new(D::DOCTYPE, opts)
    }

    /// Fail if the syncstrings row vanished or was marked deleted.
    fn check_syncstring(&self) {
        if matches!(self.state(), DocState::Closed | DocState::Error) {
            return;
        }
        match self.shared.syncstrings.get_one() {
            None => self.fail(format!("syncstring for '{}' disappeared", self.shared.path)),
            Some(row) if row.get("deleted") == Some(&Value::Bool(true)) => {
                self.fail(format!("'{}' was deleted", self.shared.path))
            }
            Some(_) => {}
        }
    }

    fn ingest_all(&self) {
        let keys: Vec<String> = self.shared.patches.get_table().keys().cloned().collect();
        self.ingest_keys(&keys);
    }

    fn ingest_keys(&self, keys: &[String]) {
        let rows = self.shared.patches.get_table();
        let mut patches: Vec<Patch<D::Patch>> = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(row) = rows.get(key) else { continue };
            match parse_patch_row::<D>(row) {
                Ok(patch) => patches.push(patch),
                Err(err) => warn!("skipping patch {key} of '{}': {}", self.shared.path, err),
            }
        }
        match self.ingest(patches) {
            Ok(true) => {
                self.shared.events.emit(DocEvent::Change);
            }
            Ok(false) => {}
            Err(err) => self.fail(format!("cannot rebuild content: {err}")),
        }
    }

    /// Merge patches into the log and bring `live` up to date.
    fn ingest(&self, mut patches: Vec<Patch<D::Patch>>) -> Result<bool, DocError> {
        patches.sort_by_key(|patch| patch.id);
        let mut inner = self.lock();
        let latest = inner.log.latest();
        let mut appended = Vec::new();
        let mut refold = false;
        for patch in patches {
            let id = patch.id;
            let is_new = inner.log.get(&id).is_none();
            if !inner.log.insert(patch) || !is_new {
                continue;
            }
            if latest.map_or(true, |latest| id > latest) {
                appended.push(id);
            } else {
                refold = true;
            }
        }
        if appended.is_empty() && !refold {
            return Ok(false);
        }

        let next = if refold {
            debug!("'{}' refolding after out-of-order patch", self.shared.path);
            inner.log.content(&self.shared.options, None)?
        } else {
            let log = &inner.log;
            appended
                .iter()
                .filter_map(|id| log.get(id))
                .fold(inner.live.clone(), |doc, patch| doc.apply_patch(&patch.patch))
        };
        if next == inner.live {
            return Ok(false);
        }
        inner.live = next;
        Ok(true)
    }

    async fn commit<F>(&self, edit: F) -> Result<Option<PatchId>, DocError>
    where
        F: FnOnce(&D) -> Result<D, DocError> + Send,
    {
        let shared = &self.shared;
        let _turn = shared.commit.lock().await;
        self.ensure_open()?;

        let (id, patch) = {
            let mut inner = self.lock();
            let target = edit(&inner.live)?;
            let patch = inner.live.make_patch(&target);
            if D::is_noop(&patch) {
                return Ok(None);
            }
            let user_id = inner.user_id.ok_or(DocError::NotReady(self.state()))?;
            let mut time = shared.client.server_time();
            if let Some(latest) = inner.log.latest() {
                if time <= latest.time {
                    time = latest.time.next();
                }
            }
            let id = PatchId { time, user_id };
            inner.log.insert(Patch {
                id,
                patch: patch.clone(),
                snapshot: None,
            });
            inner.live = inner.live.apply_patch(&patch);
            (id, patch)
        };
        shared.events.emit(DocEvent::Change);

        let row = patch_row(&shared.string_id, id, &patch)?;
        self.transition(DocState::Ready, DocState::Syncing);
        let written = shared.patches.set(row).await;
        self.transition(DocState::Syncing, DocState::Ready);

        if let Err(err) = written {
            warn!("patch {:?} on '{}' was not accepted: {}", id, shared.path, err);
            let rolled_back = {
                let mut inner = self.lock();
                inner.log.remove(&id);
                match inner.log.content::<D>(&shared.options, None) {
                    Ok(doc) => {
                        inner.live = doc;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            };
            if let Err(refold) = rolled_back {
                self.fail(format!("cannot rebuild content: {refold}"));
            }
            shared.events.emit(DocEvent::Change);
            return Err(err.into());
        }

        if let Err(err) = self.maybe_snapshot().await {
            warn!("snapshot of '{}' failed: {}", shared.path, err);
        }
        Ok(Some(id))
    }

    /// Store the full content on the newest patch once enough patches
    /// accumulated since the last snapshot.
    async fn maybe_snapshot(&self) -> Result<(), DocError> {
        let shared = &self.shared;
        let (id, content) = {
            let inner = self.lock();
            if inner.log.since_snapshot() < shared.config.snapshot_interval.max(1) {
                return Ok(());
            }
            let Some(id) = inner.log.latest() else {
                return Ok(());
            };
            (id, inner.live.to_str())
        };

        let mut row = Record::new();
        row.insert("string_id".into(), shared.string_id.clone().into());
        row.insert("time".into(), id.time.as_millis().into());
        row.insert("user_id".into(), id.user_id.into());
        row.insert("snapshot".into(), content.clone().into());
        shared.patches.set(row).await?;
        self.lock().log.set_snapshot(&id, content);

        let mut meta = Record::new();
        meta.insert("string_id".into(), shared.string_id.clone().into());
        meta.insert("last_snapshot".into(), id.time.as_millis().into());
        shared.syncstrings.set(meta).await?;
        debug!("snapshot of '{}' at {}", shared.path, id.time);
        Ok(())
    }
}

fn patch_row<P: serde::Serialize>(string_id: &str, id: PatchId, patch: &P) -> Result<Record, DocError> {
    let payload =
        serde_json::to_value(patch).map_err(|err| DocError::MalformedPatch(err.to_string()))?;
    let mut row = Record::new();
    row.insert("string_id".into(), string_id.into());
    row.insert("time".into(), id.time.as_millis().into());
    row.insert("user_id".into(), id.user_id.into());
    row.insert("patch".into(), payload);
    Ok(row)
}

/// The `users` field of a syncstrings row, `null` when absent.
fn users_of(row: Option<&Record>) -> Value {
    row.and_then(|row| row.get("users"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn parse_patch_row<D: Document>(row: &Record) -> Result<Patch<D::Patch>, DocError> {
    let time = row
        .get("time")
        .and_then(Value::as_u64)
        .ok_or_else(|| DocError::MalformedPatch("missing time".into()))?;
    let user_id = row
        .get("user_id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| DocError::MalformedPatch("missing user_id".into()))?;
    let payload = row
        .get("patch")
        .cloned()
        .ok_or_else(|| DocError::MalformedPatch("missing patch".into()))?;
    let patch =
        serde_json::from_value(payload).map_err(|err| DocError::MalformedPatch(err.to_string()))?;
    let snapshot = row.get("snapshot").and_then(Value::as_str).map(str::to_string);
    Ok(Patch {
        id: PatchId::new(time, user_id),
        patch,
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbDocument, DbOptions};
    use crate::string::{Hunk, StringDocument};
    use serde_json::json;

    async fn ready_string(db: &Arc<crate::memory::MemoryDatabase>, path: &str) -> SyncDoc<StringDocument> {
        let client: Arc<dyn Client> = Arc::new(crate::client::LocalClient::new(
            db.clone(),
            std::env::temp_dir(),
        ));
        let options = DocOptions::new(path)
            .with_config(SyncConfig::for_testing())
            .without_disk();
        let doc = SyncDoc::<StringDocument>::new(client, options).unwrap();
        doc.wait_ready(Some(Duration::from_secs(5))).await.unwrap();
        doc
    }

    fn text_patch(time: u64, user_id: u32, from: &str, to: &str) -> Patch<Vec<Hunk>> {
        Patch {
            id: PatchId::new(time, user_id),
            patch: StringDocument::new(from).make_patch(&StringDocument::new(to)),
            snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_permuted_delivery_converges() {
        let db = Arc::new(crate::memory::MemoryDatabase::for_documents());
        let in_order = ready_string(&db, "in-order.txt").await;
        let reversed = ready_string(&db, "reversed.txt").await;
        let batched = ready_string(&db, "batched.txt").await;

        let history = vec![
            text_patch(10, 0, "", "hello"),
            text_patch(10, 1, "", "world"),
            text_patch(20, 0, "hello", "hello there"),
            text_patch(30, 1, "world", "brave world"),
        ];

        for patch in history.iter().cloned() {
            in_order.ingest(vec![patch]).unwrap();
        }
        for patch in history.iter().rev().cloned() {
            reversed.ingest(vec![patch]).unwrap();
        }
        let mut shuffled = history.clone();
        shuffled.swap(0, 3);
        shuffled.swap(1, 2);
        batched.ingest(shuffled).unwrap();

        let expected = in_order.to_str();
        assert!(!expected.is_empty());
        assert_eq!(reversed.to_str(), expected);
        assert_eq!(batched.to_str(), expected);
        assert_eq!(reversed.versions(), in_order.versions());

        // Seeing a patch twice changes nothing.
        assert_eq!(reversed.ingest(vec![history[1].clone()]), Ok(false));
    }

    #[test]
    fn test_patch_row_round_trip() {
        let patch = vec![Hunk {
            start: 0,
            delete: String::new(),
            insert: "hi".into(),
        }];
        let row = patch_row("s1", PatchId::new(42, 3), &patch).unwrap();
        assert_eq!(row["string_id"], json!("s1"));
        assert_eq!(row["time"], json!(42));

        let parsed = parse_patch_row::<StringDocument>(&row).unwrap();
        assert_eq!(parsed.id, PatchId::new(42, 3));
        assert_eq!(parsed.patch, patch);
        assert_eq!(parsed.snapshot, None);
    }

    #[test]
    fn test_parse_patch_row_rejects_missing_fields() {
        let mut row = Record::new();
        row.insert("time".into(), json!(1));
        row.insert("patch".into(), json!([]));
        assert_eq!(
            parse_patch_row::<StringDocument>(&row),
            Err(DocError::MalformedPatch("missing user_id".into()))
        );

        row.insert("user_id".into(), json!(0));
        row.insert("snapshot".into(), json!("abc"));
        let parsed = parse_patch_row::<StringDocument>(&row).unwrap();
        assert_eq!(parsed.snapshot.as_deref(), Some("abc"));
    }

    #[test]
    fn test_options_from_doctype_opts() {
        let opts = json!({"primary_keys": ["id"], "snapshot_interval": 7})
            .as_object()
            .cloned()
            .unwrap();
        let options = DocOptions::<DbOptions>::from_opts("t.db", &opts).unwrap();
        assert_eq!(options.document, DbOptions::new(["id"]));
        assert_eq!(options.config.snapshot_interval, 7);
        assert_eq!(options.config.feed_timeout_ms, SyncConfig::default().feed_timeout_ms);
        assert!(DbDocument::validate(&options.document).is_ok());

        let bad = json!({"primary_keys": "id"}).as_object().cloned().unwrap();
        assert!(matches!(
            DocOptions::<DbOptions>::from_opts("t.db", &bad),
            Err(DocumentError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_doc_state_names() {
        assert_eq!(DocState::Syncing.to_string(), "syncing");
        assert_eq!(
            DocError::NotReady(DocState::Init).to_string(),
            "document is not ready (state 'init')"
        );
    }
}
