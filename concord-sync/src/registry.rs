//! Path-keyed registry of open documents and the commands acting on it.
//!
//! ```text
//!   syncstrings row ──► init_syncdoc ──► wait connected ──► wait path
//!                                                   │
//!                              DocTypeSpec::resolve ┘
//!                                       │
//!                      ┌────────────────┴───────────────┐
//!                      ▼                                ▼
//!                 SyncString                          SyncDB
//!                      └──────────► registry ◄──────────┘
//!                                     │
//!                          {cmd: "close"} by path
//! ```
//!
//! At most one document is open per path. A document leaves the registry
//! when it closes, when its syncstrings table closes or when it fails.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::changefeed::ConnectionState;
use crate::client::Client;
use crate::db::{DbOptions, SyncDB};
use crate::doc::{DocError, DocEvent, DocOptions, DocState};
use crate::document::{DocType, DocTypeSpec};
use crate::events::Subscription;
use crate::schema;
use crate::string::{StringOptions, SyncString};
use crate::table::{SyncTable, TableError, TableEvent};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    #[error("could not open '{path}': {message}")]
    Construction { path: String, message: String },
    #[error("expected a syncstrings table, got '{0}'")]
    WrongTable(String),
    #[error("syncstrings table is closed")]
    TableClosed,
    #[error(transparent)]
    Table(#[from] TableError),
}

/// An open document of any supported type.
#[derive(Debug, Clone)]
pub enum AnySyncDoc {
    String(SyncString),
    Db(SyncDB),
}

impl AnySyncDoc {
    pub fn path(&self) -> &str {
        match self {
            AnySyncDoc::String(doc) => doc.path(),
            AnySyncDoc::Db(doc) => doc.path(),
        }
    }

    pub fn string_id(&self) -> &str {
        match self {
            AnySyncDoc::String(doc) => doc.string_id(),
            AnySyncDoc::Db(doc) => doc.string_id(),
        }
    }

    pub fn doctype(&self) -> DocType {
        match self {
            AnySyncDoc::String(doc) => doc.doctype(),
            AnySyncDoc::Db(doc) => doc.doctype(),
        }
    }

    pub fn state(&self) -> DocState {
        match self {
            AnySyncDoc::String(doc) => doc.state(),
            AnySyncDoc::Db(doc) => doc.state(),
        }
    }

    pub fn subscribe(&self) -> Subscription<DocEvent> {
        match self {
            AnySyncDoc::String(doc) => doc.subscribe(),
            AnySyncDoc::Db(doc) => doc.subscribe(),
        }
    }

    pub fn to_str(&self) -> String {
        match self {
            AnySyncDoc::String(doc) => doc.to_str(),
            AnySyncDoc::Db(doc) => doc.to_str(),
        }
    }

    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), DocError> {
        match self {
            AnySyncDoc::String(doc) => doc.wait_ready(timeout).await,
            AnySyncDoc::Db(doc) => doc.wait_ready(timeout).await,
        }
    }

    pub fn close(&self) {
        match self {
            AnySyncDoc::String(doc) => doc.close(),
            AnySyncDoc::Db(doc) => doc.close(),
        }
    }

    /// Whether both handles refer to the same document.
    pub fn ptr_eq(&self, other: &AnySyncDoc) -> bool {
        match (self, other) {
            (AnySyncDoc::String(a), AnySyncDoc::String(b)) => a.ptr_eq(b),
            (AnySyncDoc::Db(a), AnySyncDoc::Db(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn as_string(&self) -> Option<&SyncString> {
        match self {
            AnySyncDoc::String(doc) => Some(doc),
            AnySyncDoc::Db(_) => None,
        }
    }

    pub fn as_db(&self) -> Option<&SyncDB> {
        match self {
            AnySyncDoc::Db(doc) => Some(doc),
            AnySyncDoc::String(_) => None,
        }
    }
}

/// Open a document of the resolved type.
pub fn create_syncdoc(
    spec: &DocTypeSpec,
    path: &str,
    string_id: Option<&str>,
    client: Arc<dyn Client>,
) -> Result<AnySyncDoc, RegistryError> {
    let construction = |message: String| RegistryError::Construction {
        path: path.to_string(),
        message,
    };
    match spec.doctype {
        DocType::String => {
            let mut options = DocOptions::<StringOptions>::from_opts(path, &spec.opts)
                .map_err(|e| construction(e.to_string()))?;
            if let Some(id) = string_id {
                options = options.with_string_id(id);
            }
            SyncString::new(client, options)
                .map(AnySyncDoc::String)
                .map_err(|e| construction(e.to_string()))
        }
        DocType::Db => {
            let mut options = DocOptions::<DbOptions>::from_opts(path, &spec.opts)
                .map_err(|e| construction(e.to_string()))?;
            if let Some(id) = string_id {
                options = options.with_string_id(id);
            }
            SyncDB::new(client, options)
                .map(AnySyncDoc::Db)
                .map_err(|e| construction(e.to_string()))
        }
    }
}

/// Extension of the file name at `path`, if it has one.
///
/// `"a/b.sage-jupyter2"` gives `"sage-jupyter2"`; `".bashrc"` has none.
pub fn filename_extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(dot) if dot + 1 < name.len() => Some(&name[dot + 1..]),
        Some(_) => None,
    }
}

/// Attaches an extra backend to a ready document, keyed by file extension.
pub type BackendHook = Arc<dyn Fn(&AnySyncDoc, &Arc<dyn Client>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Close,
}

impl Command {
    /// Parse `{cmd: "..."}`.
    pub fn parse(message: &Value) -> Result<Self, RegistryError> {
        let cmd = message
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| RegistryError::MalformedCommand(message.to_string()))?;
        match cmd {
            "close" => Ok(Command::Close),
            other => Err(RegistryError::UnrecognizedCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    NotOpen,
    Closed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::NotOpen => "not open",
            CallStatus::Closed => "successfully closed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open documents of one session, by path.
#[derive(Default)]
pub struct SyncDocRegistry {
    docs: Mutex<HashMap<String, AnySyncDoc>>,
    hooks: Mutex<HashMap<String, BackendHook>>,
}

impl fmt::Debug for SyncDocRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDocRegistry")
            .field("open", &self.open_paths())
            .finish()
    }
}

impl SyncDocRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `hook` on every document with file extension `extension` once
    /// it is ready. Replaces an earlier hook for the same extension.
    pub fn register_hook(&self, extension: impl Into<String>, hook: BackendHook) {
        lock(&self.hooks).insert(extension.into(), hook);
    }

    /// Open the document described by a syncstrings table.
    ///
    /// The returned task resolves to the open document, or `None` if the
    /// table closed first or the document could not be constructed.
    pub fn init_syncdoc(
        self: &Arc<Self>,
        client: Arc<dyn Client>,
        table: SyncTable,
    ) -> Result<JoinHandle<Option<AnySyncDoc>>, RegistryError> {
        if table.name() != schema::SYNCSTRINGS {
            return Err(RegistryError::WrongTable(table.name().to_string()));
        }
        if table.state() == ConnectionState::Closed {
            return Err(RegistryError::TableClosed);
        }
        let registry = self.clone();
        Ok(tokio::spawn(async move {
            match registry.open_from_table(client, table).await {
                Ok(doc) => doc,
                Err(err) => {
                    error!("{err}");
                    None
                }
            }
        }))
    }

    async fn open_from_table(
        self: &Arc<Self>,
        client: Arc<dyn Client>,
        table: SyncTable,
    ) -> Result<Option<AnySyncDoc>, RegistryError> {
        match table.wait_until_connected(None).await {
            Ok(()) => {}
            Err(TableError::Closed) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let rows = match table.wait(|rows| rows.values().any(has_path), None).await {
            Ok(rows) => rows,
            Err(TableError::Closed) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(row) = rows.values().find(|row| has_path(row)) else {
            return Ok(None);
        };
        let path = row
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let string_id = row.get("string_id").and_then(Value::as_str);

        if let Some(existing) = self.get(&path) {
            debug!("reusing open document '{path}'");
            return Ok(Some(existing));
        }

        let spec = DocTypeSpec::resolve(row.get("doctype"));
        let doc = create_syncdoc(&spec, &path, string_id, client.clone())?;
        {
            let mut docs = lock(&self.docs);
            if let Some(existing) = docs.get(&path) {
                let existing = existing.clone();
                drop(docs);
                doc.close();
                return Ok(Some(existing));
            }
            docs.insert(path.clone(), doc.clone());
        }
        info!("opened '{}' as {}", path, spec.doctype);

        self.watch(doc.clone(), table);
        self.run_hooks(doc.clone(), client);
        Ok(Some(doc))
    }

    /// Tear the document down when it fails or its table closes, and drop
    /// it from the registry once closed. The watcher owns `table`, so the
    /// table lives exactly as long as the document.
    fn watch(self: &Arc<Self>, doc: AnySyncDoc, table: SyncTable) {
        let registry = Arc::downgrade(self);
        let mut doc_events = doc.subscribe();
        let mut table_events = table.subscribe();
        if doc.state() == DocState::Error || table.state() == ConnectionState::Closed {
            doc.close();
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = doc_events.recv() => match event {
                        Some(DocEvent::Error(message)) => {
                            warn!("closing '{}' after error: {}", doc.path(), message);
                            doc.close();
                        }
                        Some(DocEvent::Closed) | None => break,
                        Some(_) => {}
                    },
                    event = table_events.recv() => match event {
                        Some(TableEvent::Closed) | None => {
                            doc.close();
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            table.close();
            forget(&registry, &doc);
        });
    }

    fn run_hooks(&self, doc: AnySyncDoc, client: Arc<dyn Client>) {
        let Some(extension) = filename_extension(doc.path()) else {
            return;
        };
        let Some(hook) = lock(&self.hooks).get(extension).cloned() else {
            return;
        };
        tokio::spawn(async move {
            if doc.wait_ready(None).await.is_ok() {
                debug!("running backend hook for '{}'", doc.path());
                hook(&doc, &client);
            }
        });
    }

    pub fn get(&self, path: &str) -> Option<AnySyncDoc> {
        lock(&self.docs).get(path).cloned()
    }

    pub fn open_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.docs).keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Close the document at `path`. Returns whether one was open.
    pub fn close(&self, path: &str) -> bool {
        let removed = lock(&self.docs).remove(path);
        match removed {
            Some(doc) => {
                doc.close();
                true
            }
            None => false,
        }
    }

    /// Run a command against the document at `path`.
    ///
    /// A path with no open document answers `NotOpen` whatever the command.
    pub async fn call(&self, path: &str, message: &Value) -> Result<CallStatus, RegistryError> {
        if self.get(path).is_none() {
            return Ok(CallStatus::NotOpen);
        }
        match Command::parse(message)? {
            Command::Close => {
                if self.close(path) {
                    Ok(CallStatus::Closed)
                } else {
                    Ok(CallStatus::NotOpen)
                }
            }
        }
    }

    /// Close every document at `dir` or below it. Returns how many closed.
    /// An empty `dir` (or `/`) names the root and closes everything.
    pub fn close_all_in_tree(&self, dir: &str) -> usize {
        let dir = dir.trim_end_matches('/');
        let prefix = format!("{dir}/");
        let matching: Vec<String> = lock(&self.docs)
            .keys()
            .filter(|path| dir.is_empty() || path.as_str() == dir || path.starts_with(&prefix))
            .cloned()
            .collect();
        matching.iter().filter(|path| self.close(path)).count()
    }
}

fn has_path(row: &crate::protocol::Record) -> bool {
    row.get("path").and_then(Value::as_str).is_some_and(|p| !p.is_empty())
}

fn forget(registry: &Weak<SyncDocRegistry>, doc: &AnySyncDoc) {
    let Some(registry) = registry.upgrade() else { return };
    let mut docs = lock(&registry.docs);
    if docs.get(doc.path()).is_some_and(|open| open.ptr_eq(doc)) {
        docs.remove(doc.path());
        debug!("'{}' left the registry", doc.path());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
