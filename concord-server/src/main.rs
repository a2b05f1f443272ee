//! Concord server — hosts synchronized documents and their command endpoint.
//!
//! Opens the journaled data layer, opens a document for every known
//! syncstring, and answers `{path, cmd}` frames over WebSocket.

mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use concord_sync::{
    schema, Client, CommandServer, JournalConfig, LocalClient, MemoryDatabase, ServerConfig,
    SyncConfig, SyncDocRegistry,
};
use log::{error, info};

use session::Session;

#[derive(Debug, Parser)]
#[command(name = "concord", about = "Synchronized document server")]
struct Args {
    /// Address of the command endpoint
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory holding the journal
    #[arg(long, default_value = "concord-data")]
    data_dir: PathBuf,

    /// Directory documents are saved to and loaded from
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting Concord server...");

    let journal = JournalConfig {
        path: args.data_dir.join("concord.journal"),
        ..JournalConfig::default()
    };
    let db = Arc::new(MemoryDatabase::open(
        [schema::syncstrings(), schema::patches()],
        journal,
    )?);
    let client: Arc<dyn Client> = Arc::new(LocalClient::new(db.clone(), &args.root));
    let registry = SyncDocRegistry::new();
    let session = Session::new(client, registry.clone(), SyncConfig::default());
    tokio::spawn(async move {
        if let Err(err) = session.run().await {
            error!("document session stopped: {err}");
        }
    });

    let server = CommandServer::new(
        ServerConfig {
            bind_addr: args.bind,
            ..ServerConfig::default()
        },
        registry,
    );
    server.run().await?;
    Ok(())
}
