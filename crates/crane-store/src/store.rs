//! Snapshot stores

use async_trait::async_trait;
use crane_core::{CraneError, CraneResult};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::snapshot::{ClusterSnapshot, SNAPSHOT_VERSION};

/// Durable home of the latest cluster snapshot
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the stored snapshot
    async fn save(&self, snapshot: &ClusterSnapshot) -> CraneResult<()>;

    /// Latest snapshot, or `None` if nothing was ever saved
    async fn load(&self) -> CraneResult<Option<ClusterSnapshot>>;

    /// Get the store name
    fn name(&self) -> &'static str;
}

/// Stores the snapshot as a JSON file, replaced atomically
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &ClusterSnapshot) -> CraneResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                info!(path = %parent.display(), "Created state directory");
            }
        }

        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            bytes = data.len(),
            leases = snapshot.leases.len(),
            cargoes = snapshot.cargoes.len(),
            "Saved cluster snapshot"
        );
        Ok(())
    }

    async fn load(&self) -> CraneResult<Option<ClusterSnapshot>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: ClusterSnapshot = serde_json::from_slice(&data)?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(CraneError::Storage(format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        info!(
            path = %self.path.display(),
            taken_at = %snapshot.taken_at,
            nodes = snapshot.nodes.len(),
            leases = snapshot.leases.len(),
            "Loaded cluster snapshot"
        );
        Ok(Some(snapshot))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Keeps the snapshot in memory; used when persistence is disabled
#[derive(Default)]
pub struct MemoryStateStore {
    snapshot: RwLock<Option<ClusterSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, snapshot: &ClusterSnapshot) -> CraneResult<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> CraneResult<Option<ClusterSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crane_core::{Node, NodeSpec, ResourceVector};
    use tempfile::TempDir;

    fn snapshot() -> ClusterSnapshot {
        let node = Node::new(NodeSpec::new("gpu-01", ResourceVector::gpus(8)));
        ClusterSnapshot::new(vec![node], Vec::new(), Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("nested/state.json"));

        store.save(&snapshot()).await.unwrap();
        assert!(!store.temp_path().exists());

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_VERSION);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.nodes[0].id.as_str(), "gpu-01");
    }

    #[tokio::test]
    async fn test_file_store_rejects_newer_version() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        let mut snap = snapshot();
        snap.version = SNAPSHOT_VERSION + 1;
        store.save(&snap).await.unwrap();

        assert!(matches!(store.load().await, Err(CraneError::Storage(_))));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileStateStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(CraneError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        store.save(&snapshot()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().nodes.len(), 1);
        assert_eq!(store.name(), "memory");
    }
}
