// qci-trainer-rs/src/store.rs
// Key -> document store for per-agent artifacts.
//
// Implementation notes:
// - One document per (kind, key); writes replace, never append.
// - The file store writes to a temporary sibling and renames it into place,
//   so readers never observe a half-written document.
// - Keys are storage keys (see `AgentId::storage_key`), already filesystem
//   safe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    QciResults,
    ImprovementPlan,
    OptimizationPackage,
    RolloutInstructions,
    TrainingReport,
}

impl ArtifactKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::QciResults => "qci_results",
            ArtifactKind::ImprovementPlan => "improvement_plans",
            ArtifactKind::OptimizationPackage => "optimization_packages",
            ArtifactKind::RolloutInstructions => "rollout_instructions",
            ArtifactKind::TrainingReport => "training_reports",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::RolloutInstructions => "md",
            _ => "json",
        }
    }
}

/// Location of a written artifact, as listed in the run report.
pub fn artifact_ref(kind: ArtifactKind, key: &str) -> String {
    format!("{}/{}.{}", kind.dir_name(), key, kind.extension())
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_text(&self, kind: ArtifactKind, key: &str, body: &str) -> Result<(), StoreError>;

    async fn get_text(&self, kind: ArtifactKind, key: &str) -> Result<Option<String>, StoreError>;

    async fn keys(&self, kind: ArtifactKind) -> Result<Vec<String>, StoreError>;
}

/// Typed helpers over any [`ArtifactStore`].
#[async_trait]
pub trait ArtifactStoreExt: ArtifactStore {
    async fn put_json<T>(&self, kind: ArtifactKind, key: &str, doc: &T) -> Result<(), StoreError>
    where
        T: Serialize + Sync,
    {
        let body = serde_json::to_string_pretty(doc)?;
        self.put_text(kind, key, &body).await
    }

    async fn get_json<T>(&self, kind: ArtifactKind, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_text(kind, key).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStoreExt for S {}

/// File-backed store rooted at a directory (`QCI_STORE_PATH`).
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    /// Create the store, eagerly creating the root so a bad path fails at
    /// startup rather than after the first batch.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, kind: ArtifactKind, key: &str) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{}.{}", key, kind.extension()))
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn put_text(&self, kind: ArtifactKind, key: &str, body: &str) -> Result<(), StoreError> {
        let path = self.path_for(kind, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{}.tmp-{}", kind.extension(), uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(err) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::debug!(path = %path.display(), "artifact written");
        Ok(())
    }

    async fn get_text(&self, kind: ArtifactKind, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(kind, key)).await {
            Ok(body) => Ok(Some(body)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn keys(&self, kind: ArtifactKind) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(kind.dir_name());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let suffix = format!(".{}", kind.extension());
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(&suffix) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store with the same replace semantics, for tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    docs: Mutex<HashMap<(ArtifactKind, String), String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "memory store lock poisoned",
    ))
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_text(&self, kind: ArtifactKind, key: &str, body: &str) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().map_err(|_| poisoned())?;
        docs.insert((kind, key.to_string()), body.to_string());
        Ok(())
    }

    async fn get_text(&self, kind: ArtifactKind, key: &str) -> Result<Option<String>, StoreError> {
        let docs = self.docs.lock().map_err(|_| poisoned())?;
        Ok(docs.get(&(kind, key.to_string())).cloned())
    }

    async fn keys(&self, kind: ArtifactKind) -> Result<Vec<String>, StoreError> {
        let docs = self.docs.lock().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = docs
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;
    use tokio_test::{assert_ok, block_on};

    #[tokio::test]
    async fn file_store_overwrites_instead_of_appending() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();

        store
            .put_json(ArtifactKind::QciResults, "agent%2F1", &json!({"run": 1}))
            .await
            .unwrap();
        store
            .put_json(ArtifactKind::QciResults, "agent%2F1", &json!({"run": 2}))
            .await
            .unwrap();

        let doc: Value = store
            .get_json(ArtifactKind::QciResults, "agent%2F1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc, json!({"run": 2}));

        let files: Vec<_> = std::fs::read_dir(dir.path().join("qci_results"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(files, vec!["agent%2F1.json".to_string()]);
        assert_eq!(
            store.keys(ArtifactKind::QciResults).await.unwrap(),
            vec!["agent%2F1".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_documents_are_none() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path().join("nested")).unwrap();
        let doc: Option<Value> = store.get_json(ArtifactKind::ImprovementPlan, "nope").await.unwrap();
        assert!(doc.is_none());
        assert!(store.keys(ArtifactKind::ImprovementPlan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn markdown_artifacts_use_md_extension() {
        let dir = tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path()).unwrap();
        store
            .put_text(ArtifactKind::RolloutInstructions, "a1", "# Rollout")
            .await
            .unwrap();
        assert!(dir.path().join("rollout_instructions/a1.md").exists());
        assert_eq!(artifact_ref(ArtifactKind::RolloutInstructions, "a1"), "rollout_instructions/a1.md");
    }

    #[test]
    fn memory_store_replaces_by_kind_and_key() {
        let store = MemoryArtifactStore::new();
        assert_ok!(block_on(store.put_text(ArtifactKind::QciResults, "a", "1")));
        assert_ok!(block_on(store.put_text(ArtifactKind::QciResults, "a", "2")));
        assert_ok!(block_on(store.put_text(ArtifactKind::ImprovementPlan, "a", "3")));

        assert_eq!(store.len(), 2);
        let doc = assert_ok!(block_on(store.get_text(ArtifactKind::QciResults, "a")));
        assert_eq!(doc.as_deref(), Some("2"));
    }
}
