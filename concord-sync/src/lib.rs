//! # concord-sync — Synchronized document engine
//!
//! Documents edited by many clients at once, kept convergent by folding a
//! totally ordered history of patches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   query protocol   ┌────────────────┐
//! │ Changefeed  │ ◄────────────────► │ QueryBackend   │
//! │ (per query) │  initial + deltas  │ (MemoryDatabase│
//! └──────┬──────┘                    │  + Journal)    │
//!        │                           └────────────────┘
//!        ▼
//! ┌─────────────┐
//! │ SyncTable   │  mirror of one query result, optimistic writes
//! └──────┬──────┘
//!        ▼
//! ┌─────────────┐   ┌──────────────────────┐
//! │ SyncDoc<D>  │ ◄─┤ StringDocument / Db  │  content adapters
//! └──────┬──────┘   └──────────────────────┘
//!        ▼
//! ┌─────────────┐   ┌──────────────┐
//! │ Registry    │ ◄─┤ CommandServer│  {cmd: "close"} over WebSocket
//! └─────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Queries, responses and the backend seam
//! - [`changefeed`] — One live query with explicit connection states
//! - [`table`] — Reactive mirror of a query result
//! - [`patch`] — Ordered patch history and the fold over it
//! - [`doc`] — The generic synchronized document
//! - [`string`] / [`db`] — Text and record-set content
//! - [`registry`] — Open documents by path, and commands on them
//! - [`memory`] / [`storage`] — In-process data layer and its journal
//! - [`server`] — WebSocket command endpoint

pub mod changefeed;
pub mod client;
pub mod config;
pub mod db;
pub mod doc;
pub mod document;
pub mod events;
pub mod memory;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod storage;
pub mod string;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use changefeed::{Changefeed, ConnectionError, ConnectionState, FeedEvent};
pub use client::{Client, LocalClient};
pub use config::SyncConfig;
pub use db::{DbDocument, DbOp, DbOptions, DbPatch, SyncDB};
pub use doc::{DocError, DocEvent, DocOptions, DocState, SyncDoc};
pub use document::{DocType, DocTypeSpec, Document, DocumentError};
pub use events::{EventBus, EventStats, Subscription};
pub use memory::{DatabaseStats, MemoryDatabase};
pub use patch::{fold, Patch, PatchId, PatchLog, Timestamp};
pub use protocol::{
    Action, Change, Query, QueryBackend, QueryError, QueryRequest, QueryResponse, Record,
    TableSchema,
};
pub use registry::{
    create_syncdoc, filename_extension, AnySyncDoc, BackendHook, CallStatus, Command,
    RegistryError, SyncDocRegistry,
};
pub use server::{CommandServer, ServerConfig, ServerError, ServerStats};
pub use storage::{Journal, JournalConfig, JournalError};
pub use string::{Hunk, StringDocument, StringOptions, SyncString, TextPatch};
pub use table::{Rows, SyncTable, TableError, TableEvent};
