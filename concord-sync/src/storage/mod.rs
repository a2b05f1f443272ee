//! Durable storage for the in-memory data layer.
//!
//! ```text
//! ┌────────────────┐   upsert / delete   ┌──────────────┐
//! │ MemoryDatabase │ ──────────────────► │   Journal    │
//! │  (tables)      │                     │  (one file)  │
//! └───────┬────────┘                     └──────┬───────┘
//!         ▲            replay on open           │
//!         └─────────────────────────────────────┘
//! ```

pub mod journal;

pub use journal::{EntryKind, Journal, JournalConfig, JournalEntry, JournalError, Replay, TableDump};
