//! Append-only journal of row writes, replayed on startup.
//!
//! Architecture:
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ journal file                                           │
//! │                                                        │
//! │  [len|frame] [len|frame] [len|frame] ...               │
//! │   snapshot    upsert      delete                       │
//! │   (LZ4)       (JSON row)  (JSON key)                   │
//! │                                                        │
//! │  compact(): all tables ─► one snapshot frame,          │
//! │             written aside and renamed over the file    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Each frame is a bincode-encoded [`JournalEntry`] with a checksum. Replay
//! skips frames that fail their checksum and stops at a torn tail.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Record;

/// Rows of every table, by table name.
pub type TableDump = BTreeMap<String, Vec<Record>>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("journal encode error: {0}")]
    Encode(String),
    #[error("journal decode error: {0}")]
    Decode(String),
    #[error("journal compression error: {0}")]
    Compression(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    Upsert = 1,
    Delete = 2,
    Snapshot = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub kind: EntryKind,
    /// Table name; empty for snapshots.
    pub table: String,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl JournalEntry {
    pub fn new(sequence: u64, kind: EntryKind, table: impl Into<String>, payload: Vec<u8>) -> Self {
        let table = table.into();
        let checksum = checksum(sequence, kind, &table, &payload);
        Self {
            sequence,
            kind,
            table,
            payload,
            checksum,
        }
    }

    pub fn upsert(sequence: u64, table: &str, row: &Record) -> Result<Self, JournalError> {
        let payload = serde_json::to_vec(row).map_err(|e| JournalError::Encode(e.to_string()))?;
        Ok(Self::new(sequence, EntryKind::Upsert, table, payload))
    }

    pub fn delete(sequence: u64, table: &str, key: &Record) -> Result<Self, JournalError> {
        let payload = serde_json::to_vec(key).map_err(|e| JournalError::Encode(e.to_string()))?;
        Ok(Self::new(sequence, EntryKind::Delete, table, payload))
    }

    pub fn snapshot(sequence: u64, tables: &TableDump) -> Result<Self, JournalError> {
        let raw = serde_json::to_vec(tables).map_err(|e| JournalError::Encode(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        debug!(
            "snapshot frame: {} bytes compressed to {}",
            raw.len(),
            compressed.len()
        );
        Ok(Self::new(sequence, EntryKind::Snapshot, "", compressed))
    }

    pub fn verify(&self) -> bool {
        self.checksum == checksum(self.sequence, self.kind, &self.table, &self.payload)
    }

    /// The row or key of an upsert or delete.
    pub fn record(&self) -> Result<Record, JournalError> {
        serde_json::from_slice(&self.payload).map_err(|e| JournalError::Decode(e.to_string()))
    }

    /// The tables of a snapshot.
    pub fn tables(&self) -> Result<TableDump, JournalError> {
        let raw = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| JournalError::Compression(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| JournalError::Decode(e.to_string()))
    }

    /// Length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        let body = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| JournalError::Encode(e.to_string()))?;
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode_body(body: &[u8]) -> Result<Self, JournalError> {
        let (entry, _): (Self, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| JournalError::Decode(e.to_string()))?;
        Ok(entry)
    }
}

/// FNV-1a over every field.
fn checksum(sequence: u64, kind: EntryKind, table: &str, payload: &[u8]) -> u32 {
    const PRIME: u32 = 0x0100_0193;
    let mut hash: u32 = 0x811c_9dc5;
    let fields = sequence
        .to_le_bytes()
        .into_iter()
        .chain([kind as u8])
        .chain(table.bytes())
        .chain(payload.iter().copied());
    for byte in fields {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Outcome of reading a journal.
#[derive(Debug, Default)]
pub struct Replay {
    /// Valid entries in sequence order.
    pub entries: Vec<JournalEntry>,
    /// Frames skipped because they failed to decode or verify.
    pub corrupted: usize,
}

/// Split a journal file into entries.
pub fn decode_frames(bytes: &[u8]) -> Replay {
    let mut replay = Replay::default();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 4 {
            replay.corrupted += 1;
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let Some(body) = rest.get(4..4 + len) else {
            // torn write at the tail
            replay.corrupted += 1;
            break;
        };
        match JournalEntry::decode_body(body) {
            Ok(entry) if entry.verify() => replay.entries.push(entry),
            _ => replay.corrupted += 1,
        }
        rest = &rest[4 + len..];
    }
    replay.entries.sort_by_key(|entry| entry.sequence);
    replay
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub path: PathBuf,
    /// fsync after every append.
    pub sync_writes: bool,
    /// Entries after the last snapshot that trigger compaction; 0 disables it.
    pub compact_after: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("concord.journal"),
            sync_writes: true,
            compact_after: 10_000,
        }
    }
}

impl JournalConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            compact_after: 8,
        }
    }
}

/// Open journal file accepting appends.
pub struct Journal {
    config: JournalConfig,
    file: File,
    next_sequence: u64,
    since_snapshot: usize,
}

impl Journal {
    /// Open (or create) the journal and read back what it holds.
    pub fn open(config: JournalConfig) -> Result<(Self, Replay), JournalError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let replay = match fs::read(&config.path) {
            Ok(bytes) => decode_frames(&bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Replay::default(),
            Err(err) => return Err(err.into()),
        };
        if replay.corrupted > 0 {
            warn!(
                "journal {} had {} unreadable frames",
                config.path.display(),
                replay.corrupted
            );
        }
        let next_sequence = replay.entries.last().map_or(0, |entry| entry.sequence + 1);
        let since_snapshot = replay
            .entries
            .iter()
            .rev()
            .take_while(|entry| entry.kind != EntryKind::Snapshot)
            .count();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        info!(
            "opened journal {} with {} entries",
            config.path.display(),
            replay.entries.len()
        );
        Ok((
            Self {
                config,
                file,
                next_sequence,
                since_snapshot,
            },
            replay,
        ))
    }

    pub fn append_upsert(&mut self, table: &str, row: &Record) -> Result<u64, JournalError> {
        let entry = JournalEntry::upsert(self.next_sequence, table, row)?;
        self.append(entry)
    }

    pub fn append_delete(&mut self, table: &str, key: &Record) -> Result<u64, JournalError> {
        let entry = JournalEntry::delete(self.next_sequence, table, key)?;
        self.append(entry)
    }

    fn append(&mut self, entry: JournalEntry) -> Result<u64, JournalError> {
        let frame = entry.encode()?;
        self.file.write_all(&frame)?;
        if self.config.sync_writes {
            self.file.sync_data()?;
        }
        self.next_sequence = entry.sequence + 1;
        self.since_snapshot += 1;
        Ok(entry.sequence)
    }

    pub fn needs_compaction(&self) -> bool {
        self.config.compact_after > 0 && self.since_snapshot >= self.config.compact_after
    }

    /// Replace the whole journal with one snapshot of `tables`.
    pub fn compact(&mut self, tables: &TableDump) -> Result<(), JournalError> {
        let entry = JournalEntry::snapshot(self.next_sequence, tables)?;
        let frame = entry.encode()?;
        let staging = self.config.path.with_extension("compact");
        {
            let mut out = File::create(&staging)?;
            out.write_all(&frame)?;
            out.sync_all()?;
        }
        fs::rename(&staging, &self.config.path)?;
        self.file = OpenOptions::new().append(true).open(&self.config.path)?;
        self.next_sequence = entry.sequence + 1;
        debug!(
            "compacted journal {} after {} entries",
            self.config.path.display(),
            self.since_snapshot
        );
        self.since_snapshot = 0;
        Ok(())
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn entries_since_snapshot(&self) -> usize {
        self.since_snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let entry = JournalEntry::upsert(3, "patches", &row(json!({"time": 1}))).unwrap();
        assert!(entry.verify());

        let mut tampered = entry.clone();
        tampered.payload[0] ^= 0xff;
        assert!(!tampered.verify());

        let mut moved = entry;
        moved.table = "syncstrings".into();
        assert!(!moved.verify());
    }

    #[test]
    fn test_snapshot_payload_is_compressed() {
        let rows: Vec<Record> = (0..200)
            .map(|i| row(json!({"id": i, "text": "the same text over and over"})))
            .collect();
        let mut tables = TableDump::new();
        tables.insert("t".into(), rows);

        let entry = JournalEntry::snapshot(0, &tables).unwrap();
        let raw_len = serde_json::to_vec(&tables).unwrap().len();
        assert!(entry.payload.len() < raw_len);
        assert_eq!(entry.tables().unwrap(), tables);
    }

    #[test]
    fn test_torn_tail_and_bad_frames_are_skipped() {
        let good = JournalEntry::upsert(0, "t", &row(json!({"id": 1}))).unwrap();
        let mut bad = JournalEntry::upsert(1, "t", &row(json!({"id": 2}))).unwrap();
        bad.checksum ^= 1;
        let later = JournalEntry::delete(2, "t", &row(json!({"id": 1}))).unwrap();

        let mut bytes = good.encode().unwrap();
        bytes.extend(bad.encode().unwrap());
        bytes.extend(later.encode().unwrap());
        let torn = JournalEntry::upsert(3, "t", &row(json!({"id": 3}))).unwrap();
        let torn = torn.encode().unwrap();
        bytes.extend(&torn[..torn.len() - 2]);

        let replay = decode_frames(&bytes);
        assert_eq!(replay.corrupted, 2);
        let sequences: Vec<u64> = replay.entries.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 2]);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig::for_testing(dir.path().join("db.journal"));
        {
            let (mut journal, replay) = Journal::open(config.clone()).unwrap();
            assert!(replay.entries.is_empty());
            journal.append_upsert("t", &row(json!({"id": 1}))).unwrap();
            journal.append_upsert("t", &row(json!({"id": 2}))).unwrap();
        }
        let (journal, replay) = Journal::open(config).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].record().unwrap(), row(json!({"id": 2})));
        assert_eq!(journal.next_sequence(), 2);
        assert_eq!(journal.entries_since_snapshot(), 2);
    }

    #[test]
    fn test_compaction_leaves_single_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig::for_testing(dir.path().join("db.journal"));
        let (mut journal, _) = Journal::open(config.clone()).unwrap();
        for i in 0..8 {
            journal.append_upsert("t", &row(json!({"id": i}))).unwrap();
        }
        assert!(journal.needs_compaction());

        let mut tables = TableDump::new();
        tables.insert("t".into(), vec![row(json!({"id": 7}))]);
        journal.compact(&tables).unwrap();
        journal.append_upsert("t", &row(json!({"id": 8}))).unwrap();
        drop(journal);

        let (_, replay) = Journal::open(config).unwrap();
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[0].kind, EntryKind::Snapshot);
        assert_eq!(replay.entries[0].tables().unwrap(), tables);
        assert_eq!(replay.entries[1].sequence, 9);
    }
}
