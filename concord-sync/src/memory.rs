//! In-process data layer implementing the query protocol.
//!
//! Keeps tables in memory, answers get queries, runs changefeeds with
//! per-table fan-out, applies writes as merge-upserts and optionally
//! journals every write so the tables survive a restart.
//!
//! ```text
//!   set query ──► upsert ──► journal ──► rows
//!                               │
//!                               └──► every feed whose filter matches
//!                                    ──► {action, new_val, old_val}
//! ```
//!
//! Fault injection (`hold_writes`, `disconnect_all`) lets tests drive the
//! disconnect and write-loss paths of the engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    Action, Query, QueryBackend, QueryError, QueryRequest, QueryResponse, QueryShape, Record,
    ResponseSink, TableSchema, row_matches,
};
use crate::schema;
use crate::storage::{EntryKind, Journal, JournalConfig, JournalError, TableDump};

/// Counters for monitoring the data layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub queries: u64,
    pub writes: u64,
    pub deltas_sent: u64,
    pub feeds_dropped: u64,
}

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, Record>,
}

struct Feed {
    query: Query,
    sink: ResponseSink,
}

struct HeldWrite {
    table: String,
    row: Record,
    expected: Option<Record>,
    sink: ResponseSink,
}

struct DbState {
    tables: HashMap<String, MemoryTable>,
    feeds: HashMap<String, Feed>,
    held: Vec<HeldWrite>,
    hold_writes: bool,
    journal: Option<Journal>,
    stats: DatabaseStats,
}

pub struct MemoryDatabase {
    state: Mutex<DbState>,
}

impl MemoryDatabase {
    pub fn new(schemas: impl IntoIterator<Item = TableSchema>) -> Self {
        let tables = schemas
            .into_iter()
            .map(|schema| {
                (
                    schema.name.clone(),
                    MemoryTable {
                        schema,
                        rows: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(DbState {
                tables,
                feeds: HashMap::new(),
                held: Vec::new(),
                hold_writes: false,
                journal: None,
                stats: DatabaseStats::default(),
            }),
        }
    }

    /// The tables synchronized documents use.
    pub fn for_documents() -> Self {
        Self::new([schema::syncstrings(), schema::patches()])
    }

    /// Tables backed by a journal, restored from what it holds.
    pub fn open(
        schemas: impl IntoIterator<Item = TableSchema>,
        config: JournalConfig,
    ) -> Result<Self, JournalError> {
        let db = Self::new(schemas);
        let (journal, replay) = Journal::open(config)?;
        {
            let mut state = db.lock();
            let mut restored = 0usize;
            for entry in &replay.entries {
                match entry.kind {
                    EntryKind::Snapshot => {
                        let dump = entry.tables()?;
                        for table in state.tables.values_mut() {
                            table.rows.clear();
                        }
                        for (name, rows) in dump {
                            restored += state.restore_rows(&name, rows);
                        }
                    }
                    EntryKind::Upsert => {
                        restored += state.restore_rows(&entry.table, vec![entry.record()?]);
                    }
                    EntryKind::Delete => {
                        let key = entry.record()?;
                        if let Some(table) = state.tables.get_mut(&entry.table) {
                            if let Some(key) = table.schema.key_of(&key) {
                                table.rows.remove(&key);
                            }
                        }
                    }
                }
            }
            info!(
                "restored {} rows from {} journal entries",
                restored,
                replay.entries.len()
            );
            state.journal = Some(journal);
        }
        Ok(db)
    }

    pub fn define_table(&self, schema: TableSchema) {
        let mut state = self.lock();
        state
            .tables
            .entry(schema.name.clone())
            .or_insert_with(|| MemoryTable {
                schema,
                rows: BTreeMap::new(),
            });
    }

    /// Every row of `table`, in key order.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Merge `row` into `table` and notify changefeeds.
    pub fn upsert(&self, table: &str, row: Record) -> Result<(), QueryError> {
        self.lock().upsert(table, row)
    }

    /// Remove the row with the key of `key`. Returns whether it existed.
    pub fn delete(&self, table: &str, key: &Record) -> Result<bool, QueryError> {
        self.lock().delete(table, key)
    }

    /// Park writes instead of applying them, until released.
    pub fn hold_writes(&self, hold: bool) {
        self.lock().hold_writes = hold;
    }

    /// Apply and acknowledge every parked write.
    pub fn release_writes(&self) -> usize {
        let mut state = self.lock();
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for write in held {
            let result = state.write(&write.table, write.row, write.expected.as_ref());
            let _ = write.sink.send(result.map(|_| QueryResponse::ack()));
        }
        count
    }

    /// Drop every changefeed as if the transport failed. Parked writes are
    /// dropped unacknowledged.
    pub fn disconnect_all(&self) -> usize {
        let mut state = self.lock();
        let feeds: Vec<Feed> = state.feeds.drain().map(|(_, feed)| feed).collect();
        let count = feeds.len();
        for feed in feeds {
            let _ = feed.sink.send(Err(QueryError::Disconnected));
        }
        state.held.clear();
        state.stats.feeds_dropped += count as u64;
        warn!("disconnected {count} changefeeds");
        count
    }

    pub fn feed_count(&self) -> usize {
        self.lock().feeds.len()
    }

    pub fn stats(&self) -> DatabaseStats {
        self.lock().stats.clone()
    }

    /// Fold the journal into a single snapshot now.
    pub fn compact(&self) -> Result<(), JournalError> {
        self.lock().compact()
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DbState {
    fn restore_rows(&mut self, table: &str, rows: Vec<Record>) -> usize {
        let Some(table) = self.tables.get_mut(table) else {
            warn!("journal mentions unknown table '{table}'");
            return 0;
        };
        let mut restored = 0;
        for row in rows {
            if let Some(key) = table.schema.key_of(&row) {
                table.rows.insert(key, row);
                restored += 1;
            }
        }
        restored
    }

    /// Upsert, refused with [`QueryError::Conflict`] when the stored row no
    /// longer has the fields of `expected`.
    fn write(
        &mut self,
        table_name: &str,
        row: Record,
        expected: Option<&Record>,
    ) -> Result<(), QueryError> {
        if let Some(expected) = expected {
            let table = self
                .tables
                .get(table_name)
                .ok_or_else(|| QueryError::UnknownTable(table_name.to_string()))?;
            let current = table.schema.key_of(&row).and_then(|key| table.rows.get(&key));
            if !row_matches(current, expected) {
                debug!("conditional write to '{table_name}' refused");
                return Err(QueryError::Conflict(table_name.to_string()));
            }
        }
        self.upsert(table_name, row)
    }

    fn upsert(&mut self, table_name: &str, row: Record) -> Result<(), QueryError> {
        let table = self
            .tables
            .get_mut(table_name)
            .ok_or_else(|| QueryError::UnknownTable(table_name.to_string()))?;
        let key = table.schema.key_of(&row).ok_or_else(|| {
            QueryError::Malformed(format!("row for '{table_name}' is missing its primary key"))
        })?;
        let old = table.rows.get(&key).cloned();
        let mut merged = old.clone().unwrap_or_default();
        merged.extend(row);
        if old.as_ref() == Some(&merged) {
            return Ok(());
        }
        if let Some(journal) = self.journal.as_mut() {
            journal
                .append_upsert(table_name, &merged)
                .map_err(|err| QueryError::Server(err.to_string()))?;
        }
        table.rows.insert(key, merged.clone());
        let schema = table.schema.clone();
        self.stats.writes += 1;
        self.fan_out(&schema, old, Some(merged));
        self.compact_if_needed();
        Ok(())
    }

    fn delete(&mut self, table_name: &str, key: &Record) -> Result<bool, QueryError> {
        let table = self
            .tables
            .get_mut(table_name)
            .ok_or_else(|| QueryError::UnknownTable(table_name.to_string()))?;
        let key_str = table
            .schema
            .key_of(key)
            .ok_or_else(|| QueryError::Malformed("delete without primary key".into()))?;
        if !table.rows.contains_key(&key_str) {
            return Ok(false);
        }
        if let Some(journal) = self.journal.as_mut() {
            journal
                .append_delete(table_name, &table.schema.key_fields(key))
                .map_err(|err| QueryError::Server(err.to_string()))?;
        }
        let old = table.rows.remove(&key_str);
        let schema = table.schema.clone();
        self.stats.writes += 1;
        self.fan_out(&schema, old, None);
        self.compact_if_needed();
        Ok(true)
    }

    /// Send the change to every feed on the table whose filter cares.
    fn fan_out(&mut self, schema: &TableSchema, old: Option<Record>, new: Option<Record>) {
        let mut dead = Vec::new();
        for (id, feed) in &self.feeds {
            if feed.query.table() != schema.name {
                continue;
            }
            let was = old.as_ref().is_some_and(|row| feed.query.matches(row));
            let now = new.as_ref().is_some_and(|row| feed.query.matches(row));
            let project = |row: &Record| feed.query.project(row, schema);
            let response = match (&old, &new) {
                (_, Some(row)) if now => {
                    let action = if was { Action::Update } else { Action::Insert };
                    QueryResponse::change(
                        action,
                        Some(project(row)),
                        old.as_ref().filter(|_| was).map(project),
                    )
                }
                (Some(row), _) if was => {
                    QueryResponse::change(Action::Delete, None, Some(project(row)))
                }
                _ => continue,
            };
            if feed.sink.send(Ok(response)).is_err() {
                dead.push(id.clone());
            } else {
                self.stats.deltas_sent += 1;
            }
        }
        for id in dead {
            debug!("dropping changefeed {id} with no receiver");
            self.feeds.remove(&id);
            self.stats.feeds_dropped += 1;
        }
    }

    fn dump(&self) -> TableDump {
        self.tables
            .iter()
            .map(|(name, table)| (name.clone(), table.rows.values().cloned().collect()))
            .collect()
    }

    fn compact(&mut self) -> Result<(), JournalError> {
        let dump = self.dump();
        match self.journal.as_mut() {
            Some(journal) => journal.compact(&dump),
            None => Ok(()),
        }
    }

    fn compact_if_needed(&mut self) {
        if self.journal.as_ref().is_some_and(Journal::needs_compaction) {
            if let Err(err) = self.compact() {
                warn!("journal compaction failed: {err}");
            }
        }
    }
}

#[async_trait]
impl QueryBackend for MemoryDatabase {
    fn query(&self, request: QueryRequest, sink: ResponseSink) {
        let shape = match QueryShape::parse(&request.query) {
            Ok(shape) => shape,
            Err(err) => {
                let _ = sink.send(Err(err));
                return;
            }
        };
        let mut state = self.lock();
        state.stats.queries += 1;
        match shape {
            QueryShape::Get(query) => {
                let Some(table) = state.tables.get(query.table()) else {
                    let _ = sink.send(Err(QueryError::UnknownTable(query.table().to_string())));
                    return;
                };
                let rows: Vec<Record> = table
                    .rows
                    .values()
                    .filter(|row| query.matches(row))
                    .map(|row| query.project(row, &table.schema))
                    .collect();
                let id = request.changes.then(|| Uuid::new_v4().to_string());
                let initial = QueryResponse::initial(id.clone(), query.table(), rows);
                if sink.send(Ok(initial)).is_err() {
                    return;
                }
                if let Some(id) = id {
                    debug!("changefeed {id} on '{}'", query.table());
                    state.feeds.insert(id, Feed { query, sink });
                }
            }
            QueryShape::Set { table, row } => {
                let expected = request.precondition().cloned();
                if state.hold_writes {
                    state.held.push(HeldWrite {
                        table,
                        row,
                        expected,
                        sink,
                    });
                    return;
                }
                let result = state.write(&table, row, expected.as_ref());
                let _ = sink.send(result.map(|_| QueryResponse::ack()));
            }
        }
    }

    async fn query_cancel(&self, id: &str) -> Result<(), QueryError> {
        let feed = self.lock().feeds.remove(id);
        match feed {
            Some(feed) => {
                let _ = feed.sink.send(Ok(QueryResponse::cancelled()));
                Ok(())
            }
            None => Err(QueryError::UnknownQuery(id.to_string())),
        }
    }
}
