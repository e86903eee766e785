//! Crash-recovery snapshots.
//!
//! The engine hands snapshots over without waiting; a writer task persists
//! the latest one. Snapshots are read back once, at bootstrap.

use crate::engine::state::EngineSnapshot;
use crate::error::GridError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Queues a snapshot for writing. Never blocks; the latest one wins.
    fn save(&self, snapshot: EngineSnapshot);

    async fn load(&self) -> Result<Option<EngineSnapshot>, GridError>;

    /// `false` once a write has failed and not yet recovered.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Snapshot stored as pretty JSON, replaced atomically via a temp file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self, snapshot: &EngineSnapshot) -> Result<(), GridError> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| GridError::PersistenceFailure(format!("serialize: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    GridError::PersistenceFailure(format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| GridError::PersistenceFailure(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            GridError::PersistenceFailure(format!("rename to {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }

    pub async fn read(&self) -> Result<Option<EngineSnapshot>, GridError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GridError::PersistenceFailure(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| GridError::PersistenceFailure(format!("parse {}: {}", self.path.display(), e)))
    }
}

/// Fire-and-forget front of a [`JsonFileStore`].
#[derive(Clone)]
pub struct SnapshotWriter {
    store: JsonFileStore,
    tx: Arc<watch::Sender<Option<EngineSnapshot>>>,
    healthy: Arc<AtomicBool>,
}

impl SnapshotWriter {
    /// Starts the writer task. It exits once every clone is dropped, after
    /// writing the last queued snapshot.
    pub fn spawn(store: JsonFileStore, timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel::<Option<EngineSnapshot>>(None);
        let healthy = Arc::new(AtomicBool::new(true));
        let task_store = store.clone();
        let task_healthy = healthy.clone();

        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    write_once(&task_store, &snapshot, &task_healthy, timeout).await;
                }
            }
            debug!("Snapshot writer stopped.");
        });

        (
            Self {
                store,
                tx: Arc::new(tx),
                healthy,
            },
            handle,
        )
    }
}

async fn write_once(
    store: &JsonFileStore,
    snapshot: &EngineSnapshot,
    healthy: &AtomicBool,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, store.write(snapshot)).await {
        Ok(Ok(())) => {
            if !healthy.swap(true, Ordering::SeqCst) {
                info!("[PERSIST] Snapshot writes recovered.");
            }
        }
        Ok(Err(e)) => {
            healthy.store(false, Ordering::SeqCst);
            error!("[PERSIST] {}. Continuing in memory.", e);
        }
        Err(_) => {
            healthy.store(false, Ordering::SeqCst);
            error!(
                "[PERSIST] Snapshot write timed out after {:?}. Continuing in memory.",
                timeout
            );
        }
    }
}

#[async_trait]
impl PersistenceSink for SnapshotWriter {
    fn save(&self, snapshot: EngineSnapshot) {
        if self.tx.send(Some(snapshot)).is_err() {
            warn!("[PERSIST] Snapshot writer is gone; snapshot dropped.");
        }
    }

    async fn load(&self) -> Result<Option<EngineSnapshot>, GridError> {
        self.store.read().await
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps snapshots in memory; `load` returns the preset one.
    #[derive(Clone, Default)]
    pub struct MemorySink {
        initial: Arc<Mutex<Option<EngineSnapshot>>>,
        saved: Arc<Mutex<Vec<EngineSnapshot>>>,
    }

    impl MemorySink {
        pub fn with_snapshot(snapshot: EngineSnapshot) -> Self {
            let sink = Self::default();
            *sink.initial.lock().unwrap() = Some(snapshot);
            sink
        }

        pub fn last(&self) -> Option<EngineSnapshot> {
            self.saved.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl PersistenceSink for MemorySink {
        fn save(&self, snapshot: EngineSnapshot) {
            self.saved.lock().unwrap().push(snapshot);
        }

        async fn load(&self) -> Result<Option<EngineSnapshot>, GridError> {
            Ok(self.initial.lock().unwrap().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::EngineState;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn snapshot(anchor: rust_decimal::Decimal) -> EngineSnapshot {
        let mut state = EngineState::new();
        state.anchor = anchor;
        state.snapshot("BNB/USDC")
    }

    #[tokio::test]
    async fn test_store_roundtrip_and_missing_file() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state").join("grid.json"));
        assert!(store.read().await.unwrap().is_none());

        let snap = snapshot(dec!(550));
        store.write(&snap).await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_persistence_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grid.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.read().await,
            Err(GridError::PersistenceFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_writer_persists_latest_snapshot_before_exit() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("grid.json"));
        let (writer, handle) = SnapshotWriter::spawn(store.clone(), Duration::from_secs(1));

        writer.save(snapshot(dec!(550)));
        writer.save(snapshot(dec!(605)));
        drop(writer);
        handle.await.unwrap();

        let stored = store.read().await.unwrap().unwrap();
        assert_eq!(stored.anchor, dec!(605));
    }

    #[tokio::test]
    async fn test_writer_flags_unhealthy_on_failure() {
        let dir = tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("grid.json");
        std::fs::create_dir_all(&path).unwrap();
        let (writer, handle) = SnapshotWriter::spawn(JsonFileStore::new(&path), Duration::from_secs(1));

        writer.save(snapshot(dec!(550)));
        let probe = writer.clone();
        drop(writer);
        // Wait until the write attempt settled.
        for _ in 0..100 {
            if !probe.is_healthy() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!probe.is_healthy());
        drop(probe);
        handle.await.unwrap();
    }
}
