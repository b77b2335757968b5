//! Per-conversation resume checkpoints.
//!
//! A checkpoint is the newest `created_at` a timeline has accepted. It is read
//! once when a subscription is created and only ever moves forward.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("invalid conversation id: {0}")]
    InvalidId(String),
    #[error("checkpoint io failure: {0}")]
    Io(String),
    #[error("checkpoint serialization failure: {0}")]
    Serialization(String),
}

impl From<io::Error> for CheckpointError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Key/timestamp persistence used by [`TimestampCheckpoint`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<i64>, CheckpointError>;

    async fn store(&self, conversation_id: &str, timestamp: i64) -> Result<(), CheckpointError>;

    async fn clear(&self, conversation_id: &str) -> Result<(), CheckpointError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    data: Arc<RwLock<HashMap<String, i64>>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<i64>, CheckpointError> {
        Ok(self.data.read().await.get(conversation_id).copied())
    }

    async fn store(&self, conversation_id: &str, timestamp: i64) -> Result<(), CheckpointError> {
        self.data
            .write()
            .await
            .insert(conversation_id.to_owned(), timestamp);
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), CheckpointError> {
        self.data.write().await.remove(conversation_id);
        Ok(())
    }
}

/// JSON-file store holding every conversation's checkpoint in one document.
///
/// The document is loaded lazily on first access and rewritten through a
/// temp file plus rename on every change.
pub struct FileCheckpointStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, i64>>>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    async fn read_document(&self) -> Result<BTreeMap<String, i64>, CheckpointError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw).map_err(|err| {
            CheckpointError::Serialization(format!(
                "failed parsing checkpoints {}: {err}",
                self.path.display()
            ))
        })
    }

    async fn write_document(&self, document: &BTreeMap<String, i64>) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let encoded = serde_json::to_vec_pretty(document)
            .map_err(|err| CheckpointError::Serialization(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        tokio::fs::write(&temp_path, encoded).await?;

        if let Err(rename_err) = tokio::fs::rename(&temp_path, &self.path).await {
            // Windows does not allow replacing existing files via rename.
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(CheckpointError::Io(format!(
                        "failed replacing {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            if let Err(err) = tokio::fs::rename(&temp_path, &self.path).await {
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(err.into());
            }
        }

        debug!(path = %self.path.display(), entries = document.len(), "checkpoints persisted");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<i64>, CheckpointError> {
        validate_conversation_id(conversation_id)?;
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.read_document().await?);
        }
        Ok(cache
            .as_ref()
            .and_then(|document| document.get(conversation_id).copied()))
    }

    async fn store(&self, conversation_id: &str, timestamp: i64) -> Result<(), CheckpointError> {
        validate_conversation_id(conversation_id)?;
        let mut cache = self.cache.lock().await;
        let mut document = match cache.take() {
            Some(document) => document,
            None => self.read_document().await?,
        };
        document.insert(conversation_id.to_owned(), timestamp);
        let result = self.write_document(&document).await;
        *cache = Some(document);
        result
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), CheckpointError> {
        validate_conversation_id(conversation_id)?;
        let mut cache = self.cache.lock().await;
        let mut document = match cache.take() {
            Some(document) => document,
            None => self.read_document().await?,
        };
        let removed = document.remove(conversation_id).is_some();
        let result = if removed {
            self.write_document(&document).await
        } else {
            Ok(())
        };
        *cache = Some(document);
        result
    }
}

/// Monotonic last-seen timestamp per conversation.
#[derive(Clone)]
pub struct TimestampCheckpoint {
    store: Arc<dyn CheckpointStore>,
}

impl TimestampCheckpoint {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Checkpoint backed by a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::default()))
    }

    /// Last recorded timestamp, `None` if never recorded.
    pub async fn last_seen(&self, conversation_id: &str) -> Result<Option<i64>, CheckpointError> {
        self.store.load(conversation_id).await
    }

    /// Record `timestamp` unless it is not newer than the stored value.
    ///
    /// Returns whether the checkpoint advanced.
    pub async fn update(
        &self,
        conversation_id: &str,
        timestamp: i64,
    ) -> Result<bool, CheckpointError> {
        if let Some(current) = self.store.load(conversation_id).await?
            && timestamp <= current
        {
            return Ok(false);
        }
        self.store.store(conversation_id, timestamp).await?;
        Ok(true)
    }

    /// Forget the checkpoint for a conversation.
    pub async fn reset(&self, conversation_id: &str) -> Result<(), CheckpointError> {
        self.store.clear(conversation_id).await
    }
}

/// Reject IDs that are empty or contain control characters.
pub fn validate_conversation_id(conversation_id: &str) -> Result<(), CheckpointError> {
    if conversation_id.trim().is_empty() {
        return Err(CheckpointError::InvalidId(
            "conversation id cannot be empty".to_owned(),
        ));
    }
    if conversation_id.chars().any(char::is_control) {
        return Err(CheckpointError::InvalidId(format!(
            "conversation id contains control characters: {conversation_id:?}"
        )));
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("checkpoints.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir()
            .join(format!("timeline-{label}-{now_nanos}"))
            .join("checkpoints.json")
    }

    #[tokio::test]
    async fn returns_none_when_never_recorded() {
        let checkpoint = TimestampCheckpoint::in_memory();
        assert_eq!(checkpoint.last_seen("conv-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ignores_older_updates() {
        let checkpoint = TimestampCheckpoint::in_memory();
        assert!(checkpoint.update("conv-1", 100).await.unwrap());
        assert!(!checkpoint.update("conv-1", 40).await.unwrap());
        assert!(!checkpoint.update("conv-1", 100).await.unwrap());
        assert_eq!(checkpoint.last_seen("conv-1").await.unwrap(), Some(100));

        assert!(checkpoint.update("conv-1", 101).await.unwrap());
        assert_eq!(checkpoint.last_seen("conv-1").await.unwrap(), Some(101));
    }

    #[tokio::test]
    async fn isolates_conversations() {
        let checkpoint = TimestampCheckpoint::in_memory();
        checkpoint.update("a", 5).await.unwrap();
        checkpoint.update("b", 1).await.unwrap();
        assert_eq!(checkpoint.last_seen("a").await.unwrap(), Some(5));
        assert_eq!(checkpoint.last_seen("b").await.unwrap(), Some(1));

        checkpoint.reset("a").await.unwrap();
        assert_eq!(checkpoint.last_seen("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let path = unique_temp_path("file-store");
        {
            let checkpoint = TimestampCheckpoint::new(Arc::new(FileCheckpointStore::new(&path)));
            checkpoint.update("conv-1", 1_731_000_000).await.unwrap();
            checkpoint.update("conv-2", 7).await.unwrap();
        }

        let reopened = TimestampCheckpoint::new(Arc::new(FileCheckpointStore::new(&path)));
        assert_eq!(
            reopened.last_seen("conv-1").await.unwrap(),
            Some(1_731_000_000)
        );
        assert!(!reopened.update("conv-1", 5).await.unwrap());

        reopened.reset("conv-2").await.unwrap();
        assert_eq!(reopened.last_seen("conv-2").await.unwrap(), None);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_document() {
        let path = unique_temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();

        let store = FileCheckpointStore::new(&path);
        let err = store.load("conv-1").await.expect_err("corrupt file must fail");
        assert!(matches!(err, CheckpointError::Serialization(_)));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rejects_invalid_conversation_ids() {
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("bad\nid").is_err());
        assert!(validate_conversation_id("group_channel_1").is_ok());
    }

    struct FailingStore;

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn load(&self, _conversation_id: &str) -> Result<Option<i64>, CheckpointError> {
            Err(CheckpointError::Io("mock outage".to_owned()))
        }

        async fn store(&self, _conversation_id: &str, _ts: i64) -> Result<(), CheckpointError> {
            Err(CheckpointError::Io("mock outage".to_owned()))
        }

        async fn clear(&self, _conversation_id: &str) -> Result<(), CheckpointError> {
            Err(CheckpointError::Io("mock outage".to_owned()))
        }
    }

    #[tokio::test]
    async fn mock_failure_propagates_through_checkpoint() {
        let checkpoint = TimestampCheckpoint::new(Arc::new(FailingStore));
        let err = checkpoint.update("conv-1", 1).await.expect_err("update must fail");
        assert_eq!(err, CheckpointError::Io("mock outage".to_owned()));
    }
}
