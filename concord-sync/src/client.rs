//! The session a document runs in: identity, clock, data layer and files.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::patch::Timestamp;
use crate::protocol::QueryBackend;

/// What a synchronized document needs from its host process.
#[async_trait]
pub trait Client: Send + Sync {
    /// Stable id of this client, registered in a document's `users` list.
    fn client_id(&self) -> &str;

    fn project_id(&self) -> &str;

    /// Current time corrected to the server's clock.
    fn server_time(&self) -> Timestamp;

    fn backend(&self) -> Arc<dyn QueryBackend>;

    /// File contents, or `None` if the file does not exist.
    async fn read_file(&self, path: &str) -> io::Result<Option<String>>;

    async fn write_file(&self, path: &str, content: &str) -> io::Result<()>;
}

/// A client backed by a directory on the local filesystem.
pub struct LocalClient {
    client_id: String,
    project_id: String,
    root: PathBuf,
    backend: Arc<dyn QueryBackend>,
    clock_skew_ms: AtomicI64,
}

impl LocalClient {
    pub fn new(backend: Arc<dyn QueryBackend>, root: impl Into<PathBuf>) -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            project_id: Uuid::nil().to_string(),
            root: root.into(),
            backend,
            clock_skew_ms: AtomicI64::new(0),
        }
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record the offset between the server clock and ours.
    pub fn set_clock_skew(&self, skew_ms: i64) {
        self.clock_skew_ms.store(skew_ms, Ordering::Relaxed);
    }

    /// Resolve a document path under the root, refusing to leave it.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes the project root: {path}"),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Client for LocalClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn project_id(&self) -> &str {
        &self.project_id
    }

    fn server_time(&self) -> Timestamp {
        let now = Timestamp::now().as_millis() as i64;
        let skew = self.clock_skew_ms.load(Ordering::Relaxed);
        Timestamp(now.saturating_add(skew).max(0) as u64)
    }

    fn backend(&self) -> Arc<dyn QueryBackend> {
        self.backend.clone()
    }

    async fn read_file(&self, path: &str) -> io::Result<Option<String>> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content).await?;
        debug!("wrote {} bytes to {}", content.len(), full.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn client(root: &Path) -> LocalClient {
        LocalClient::new(Arc::new(ScriptedBackend::default()), root)
    }

    #[tokio::test]
    async fn test_read_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(client(dir.path()).read_file("nope.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path());
        c.write_file("/a/b/c.txt", "hi").await.unwrap();
        assert_eq!(c.read_file("a/b/c.txt").await.unwrap().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = client(dir.path()).read_file("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_clock_skew() {
        let dir = tempfile::tempdir().unwrap();
        let c = client(dir.path());
        let before = c.server_time();
        c.set_clock_skew(60_000);
        assert!(c.server_time().as_millis() >= before.as_millis() + 59_000);
    }
}
