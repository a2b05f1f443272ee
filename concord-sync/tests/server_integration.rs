//! Integration tests for the WebSocket command endpoint.
//!
//! These tests start a real server and drive it with a real client.

use std::sync::Arc;
use std::time::Duration;

use concord_sync::{
    schema, Client, CommandServer, LocalClient, MemoryDatabase, Query, ServerConfig, SyncConfig,
    SyncDocRegistry, SyncTable,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Start a server on a free port, return its URL.
async fn start_test_server(registry: Arc<SyncDocRegistry>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = CommandServer::new(ServerConfig::for_testing(), registry);
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://{addr}")
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn roundtrip(ws: &mut Socket, frame: Value) -> Value {
    ws.send(Message::text(frame.to_string())).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    serde_json::from_str(reply.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server(SyncDocRegistry::new()).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_commands_over_websocket() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemoryDatabase::for_documents());
    let client: Arc<dyn Client> = Arc::new(LocalClient::new(db.clone(), dir.path()));
    let registry = SyncDocRegistry::new();

    let string_id = schema::string_id(client.project_id(), "remote.txt");
    db.upsert(
        schema::SYNCSTRINGS,
        json!({"string_id": string_id, "path": "remote.txt"})
            .as_object()
            .cloned()
            .unwrap(),
    )
    .unwrap();
    let table = SyncTable::new(
        db.clone(),
        schema::syncstrings(),
        Query::new(schema::SYNCSTRINGS).filter("string_id", string_id),
        SyncConfig::for_testing(),
    );
    let task = registry.init_syncdoc(client, table.clone()).unwrap();
    table.connect().await.unwrap();
    let doc = task.await.unwrap().unwrap();

    let url = start_test_server(registry.clone()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    assert_eq!(
        roundtrip(&mut ws, json!({"path": "remote.txt", "cmd": "launch"})).await,
        json!({"error": "unrecognized command 'launch'"})
    );
    assert_eq!(
        roundtrip(&mut ws, json!({"path": "remote.txt", "cmd": "close"})).await,
        json!({"status": "successfully closed"})
    );
    assert_eq!(
        roundtrip(&mut ws, json!({"path": "remote.txt", "cmd": "close"})).await,
        json!({"status": "not open"})
    );
    assert!(registry.get("remote.txt").is_none());
    assert_eq!(doc.state(), concord_sync::DocState::Closed);
}

#[tokio::test]
async fn test_malformed_frames_get_errors() {
    let url = start_test_server(SyncDocRegistry::new()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    assert_eq!(
        roundtrip(&mut ws, json!({"cmd": "close"})).await,
        json!({"error": "missing path"})
    );
    assert_eq!(
        roundtrip(&mut ws, json!({"path": "a.txt"})).await,
        json!({"status": "not open"})
    );
    assert!(roundtrip(&mut ws, json!("just a string")).await["error"]
        .as_str()
        .unwrap()
        .starts_with("missing path"));
}
