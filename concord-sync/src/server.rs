//! WebSocket endpoint for the document command channel.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── "a.txt"  ─► SyncString
//!             ├── CommandServer ──► registry
//! Client B ──┘   (task per peer)    └── "t.db"   ─► SyncDB
//! ```
//!
//! Every text frame is one command, `{"path": ..., "cmd": ...}`, answered
//! with `{"status": ...}` or `{"error": ...}`. Binary frames are ignored.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::registry::SyncDocRegistry;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted command frame, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub commands: u64,
    pub failed_commands: u64,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    commands: AtomicU64,
    failed_commands: AtomicU64,
}

/// Serves registry commands over WebSocket.
pub struct CommandServer {
    config: ServerConfig,
    registry: Arc<SyncDocRegistry>,
    counters: Arc<Counters>,
}

impl CommandServer {
    pub fn new(config: ServerConfig, registry: Arc<SyncDocRegistry>) -> Self {
        Self {
            config,
            registry,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Command server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let counters = self.counters.clone();
            let max_frame_bytes = self.config.max_frame_bytes;

            tokio::spawn(async move {
                counters.total_connections.fetch_add(1, Ordering::Relaxed);
                counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, &counters, max_frame_bytes).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SyncDocRegistry>,
        counters: &Counters,
        max_frame_bytes: usize,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    counters.commands.fetch_add(1, Ordering::Relaxed);
                    let reply = if text.len() > max_frame_bytes {
                        json!({"error": format!("frame exceeds {max_frame_bytes} bytes")})
                    } else {
                        dispatch(&registry, text.as_str()).await
                    };
                    if reply.get("error").is_some() {
                        counters.failed_commands.fetch_add(1, Ordering::Relaxed);
                    }
                    ws_sender.send(Message::Text(reply.to_string().into())).await?;
                }
                Ok(Message::Ping(data)) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            commands: self.counters.commands.load(Ordering::Relaxed),
            failed_commands: self.counters.failed_commands.load(Ordering::Relaxed),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SyncDocRegistry> {
        &self.registry
    }
}

/// Run one command frame against the registry.
pub async fn dispatch(registry: &SyncDocRegistry, text: &str) -> Value {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => return json!({"error": format!("invalid JSON: {e}")}),
    };
    let Some(path) = message.get("path").and_then(Value::as_str) else {
        return json!({"error": "missing path"});
    };
    match registry.call(path, &message).await {
        Ok(status) => json!({"status": status.as_str()}),
        Err(e) => {
            log::warn!("command on '{path}' failed: {e}");
            json!({"error": e.to_string()})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_frame_bytes, 64 * 1024);
        assert_eq!(ServerConfig::for_testing().bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn test_server_stats_initial() {
        let server = CommandServer::new(ServerConfig::for_testing(), SyncDocRegistry::new());
        assert_eq!(server.stats(), ServerStats::default());
        assert!(server.registry().open_paths().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_replies() {
        let registry = SyncDocRegistry::new();
        assert_eq!(
            dispatch(&registry, r#"{"path": "a.txt", "cmd": "close"}"#).await,
            json!({"status": "not open"})
        );
        assert_eq!(
            dispatch(&registry, r#"{"path": "a.txt", "cmd": "save"}"#).await,
            json!({"status": "not open"})
        );
        assert_eq!(
            dispatch(&registry, r#"{"cmd": "close"}"#).await,
            json!({"error": "missing path"})
        );
        let reply = dispatch(&registry, "not json").await;
        assert!(reply["error"].as_str().unwrap().starts_with("invalid JSON"));
    }
}
