//! Opens a document for every syncstrings row the data layer holds.
//!
//! A row whose document is not open (never opened, closed by command or
//! torn down after an error) is opened again the next time the row changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use concord_sync::{
    schema, Client, Query, Record, SyncConfig, SyncDocRegistry, SyncTable, TableError, TableEvent,
};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::task::JoinHandle;

const RECONNECT_MIN: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

pub struct Session {
    client: Arc<dyn Client>,
    registry: Arc<SyncDocRegistry>,
    config: SyncConfig,
    /// Opening tasks by string id.
    opening: HashMap<String, JoinHandle<()>>,
}

impl Session {
    pub fn new(client: Arc<dyn Client>, registry: Arc<SyncDocRegistry>, config: SyncConfig) -> Self {
        Self {
            client,
            registry,
            config,
            opening: HashMap::new(),
        }
    }

    /// Follow the syncstrings table until it closes, reconnecting with
    /// backoff whenever the changefeed is lost.
    pub async fn run(mut self) -> Result<(), TableError> {
        let all = SyncTable::new(
            self.client.backend(),
            schema::syncstrings(),
            Query::new(schema::SYNCSTRINGS),
            self.config.clone(),
        );
        let mut events = all.subscribe();
        connect_with_backoff(&all).await?;
        self.open_rows(&all, None);

        while let Some(event) = events.recv().await {
            match event {
                TableEvent::Connected => self.open_rows(&all, None),
                TableEvent::Change(keys) => self.open_rows(&all, Some(keys.as_slice())),
                TableEvent::Disconnected => {
                    warn!("syncstrings changefeed lost, reconnecting");
                    connect_with_backoff(&all).await?;
                }
                TableEvent::Closed => break,
            }
        }
        Ok(())
    }

    /// Open the documents of `keys` (every row when `None`) that are not
    /// open or opening.
    fn open_rows(&mut self, all: &SyncTable, keys: Option<&[String]>) {
        self.opening.retain(|_, task| !task.is_finished());
        let rows = all.get_table();
        let candidates: Vec<&Record> = match keys {
            Some(keys) => keys.iter().filter_map(|key| rows.get(key)).collect(),
            None => rows.values().collect(),
        };
        for row in candidates {
            let Some(string_id) = row.get("string_id").and_then(Value::as_str) else {
                continue;
            };
            let Some(path) = row.get("path").and_then(Value::as_str) else {
                continue;
            };
            let deleted = row.get("deleted").and_then(Value::as_bool).unwrap_or(false);
            if deleted
                || path.is_empty()
                || self.opening.contains_key(string_id)
                || self.registry.get(path).is_some()
            {
                continue;
            }
            if let Some(task) = self.open(string_id) {
                self.opening.insert(string_id.to_string(), task);
            }
        }
    }

    fn open(&self, string_id: &str) -> Option<JoinHandle<()>> {
        let table = SyncTable::new(
            self.client.backend(),
            schema::syncstrings(),
            Query::new(schema::SYNCSTRINGS).filter("string_id", string_id),
            self.config.clone(),
        );
        let task = match self.registry.init_syncdoc(self.client.clone(), table.clone()) {
            Ok(task) => task,
            Err(err) => {
                warn!("cannot open {string_id}: {err}");
                return None;
            }
        };
        debug!("opening syncstring {string_id}");
        Some(tokio::spawn(async move {
            if let Err(err) = table.connect().await {
                warn!("syncstrings table did not connect: {err}");
                table.close();
                return;
            }
            if let Ok(Some(doc)) = task.await {
                info!("serving '{}' ({})", doc.path(), doc.doctype());
            }
        }))
    }
}

/// Connect `table`, doubling the delay between failed attempts.
async fn connect_with_backoff(table: &SyncTable) -> Result<(), TableError> {
    let mut delay = RECONNECT_MIN;
    loop {
        match table.connect().await {
            Ok(()) => return Ok(()),
            Err(TableError::Closed) => return Err(TableError::Closed),
            Err(err) => {
                warn!("syncstrings did not connect ({err}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_sync::{CallStatus, LocalClient, MemoryDatabase};
    use serde_json::json;

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    fn touch(db: &MemoryDatabase, client: &Arc<dyn Client>, path: &str, stamp: u64) {
        let row = json!({
            "string_id": schema::string_id(client.project_id(), path),
            "path": path,
            "touched": stamp,
        });
        db.upsert(schema::SYNCSTRINGS, row.as_object().cloned().unwrap())
            .unwrap();
    }

    fn start() -> (Arc<MemoryDatabase>, Arc<dyn Client>, Arc<SyncDocRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(MemoryDatabase::for_documents());
        let client: Arc<dyn Client> = Arc::new(LocalClient::new(db.clone(), dir.path()));
        let registry = SyncDocRegistry::new();
        let session = Session::new(client.clone(), registry.clone(), SyncConfig::for_testing());
        tokio::spawn(session.run());
        (db, client, registry, dir)
    }

    #[tokio::test]
    async fn test_opens_rows_and_reopens_after_close() {
        let (db, client, registry, _dir) = start();
        touch(&db, &client, "a.txt", 1);
        eventually(|| registry.get("a.txt").is_some()).await;
        let first = registry.get("a.txt").unwrap();
        first.wait_ready(Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(
            registry.call("a.txt", &json!({"cmd": "close"})).await,
            Ok(CallStatus::Closed)
        );
        assert!(registry.get("a.txt").is_none());

        touch(&db, &client, "a.txt", 2);
        eventually(|| registry.get("a.txt").is_some_and(|doc| !doc.ptr_eq(&first))).await;
    }

    #[tokio::test]
    async fn test_keeps_opening_after_lost_feed() {
        let (db, client, registry, _dir) = start();
        touch(&db, &client, "before.txt", 1);
        eventually(|| registry.get("before.txt").is_some()).await;

        db.disconnect_all();
        touch(&db, &client, "after.txt", 1);
        eventually(|| registry.get("after.txt").is_some()).await;
    }

    #[tokio::test]
    async fn test_deleted_rows_are_not_opened() {
        let (db, client, registry, _dir) = start();
        let row = json!({
            "string_id": schema::string_id(client.project_id(), "gone.txt"),
            "path": "gone.txt",
            "deleted": true,
        });
        db.upsert(schema::SYNCSTRINGS, row.as_object().cloned().unwrap())
            .unwrap();
        touch(&db, &client, "kept.txt", 1);

        eventually(|| registry.get("kept.txt").is_some()).await;
        assert!(registry.get("gone.txt").is_none());
    }
}
