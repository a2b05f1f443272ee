//! Integration tests for journal-backed persistence.
//!
//! Documents are edited against a journaled data layer, the layer is
//! dropped, and a fresh one opened from the same journal must serve the
//! same documents.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use concord_sync::storage::{EntryKind, Journal};
use concord_sync::{
    schema, Client, DocOptions, JournalConfig, LocalClient, MemoryDatabase, SyncConfig,
    SyncString,
};

const READY: Option<Duration> = Some(Duration::from_secs(5));

fn open_db(path: &Path) -> Arc<MemoryDatabase> {
    let config = JournalConfig::for_testing(path);
    Arc::new(MemoryDatabase::open([schema::syncstrings(), schema::patches()], config).unwrap())
}

async fn open_doc(db: &Arc<MemoryDatabase>, root: &Path, path: &str) -> SyncString {
    let client: Arc<dyn Client> = Arc::new(LocalClient::new(db.clone(), root));
    let options = DocOptions::new(path)
        .with_config(SyncConfig::for_testing())
        .without_disk();
    let doc = SyncString::new(client, options).unwrap();
    doc.wait_ready(READY).await.unwrap();
    doc
}

#[tokio::test]
async fn test_documents_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("data").join("concord.journal");

    {
        let db = open_db(&journal);
        let doc = open_doc(&db, dir.path(), "kept.txt").await;
        doc.set_text("first").await.unwrap();
        doc.set_text("first second").await.unwrap();
        doc.close();
    }

    let db = open_db(&journal);
    assert_eq!(db.rows("patches").len(), 2);
    let doc = open_doc(&db, dir.path(), "kept.txt").await;
    assert_eq!(doc.text(), "first second");
    assert_eq!(doc.versions().len(), 2);
}

#[tokio::test]
async fn test_compaction_keeps_content() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("concord.journal");

    {
        let db = open_db(&journal);
        let doc = open_doc(&db, dir.path(), "busy.txt").await;
        let mut text = String::new();
        for i in 0..12 {
            text.push_str(&format!("line {i}\n"));
            doc.set_text(&text).await.unwrap();
        }
        doc.close();
    }

    let (_, replay) = Journal::open(JournalConfig::for_testing(&journal)).unwrap();
    assert_eq!(replay.corrupted, 0);
    assert!(replay
        .entries
        .iter()
        .any(|entry| entry.kind == EntryKind::Snapshot));
    assert!(replay.entries.len() < 12);

    let db = open_db(&journal);
    let doc = open_doc(&db, dir.path(), "busy.txt").await;
    assert!(doc.text().starts_with("line 0\n"));
    assert!(doc.text().ends_with("line 11\n"));
}

#[tokio::test]
async fn test_manual_compaction_then_more_writes() {
    let dir = tempfile::tempdir().unwrap();
    let journal = dir.path().join("concord.journal");

    {
        let db = open_db(&journal);
        let doc = open_doc(&db, dir.path(), "c.txt").await;
        doc.set_text("before").await.unwrap();
        db.compact().unwrap();
        doc.set_text("before after").await.unwrap();
        doc.close();
    }

    let db = open_db(&journal);
    let doc = open_doc(&db, dir.path(), "c.txt").await;
    assert_eq!(doc.text(), "before after");
}
