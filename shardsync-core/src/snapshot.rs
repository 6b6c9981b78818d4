//! Last-synced state, persisted as one JSON document.

use crate::consensus::RemoteTree;
use crate::{EntryKind, Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub hash: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotCache {
    entries: BTreeMap<String, SnapshotEntry>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_remote_tree(tree: &RemoteTree) -> Self {
        let mut cache = Self::new();
        for dir in &tree.directories {
            cache.insert(SnapshotEntry {
                path: dir.clone(),
                hash: String::new(),
                size: 0,
                kind: EntryKind::Directory,
            });
        }
        for (path, file) in &tree.files {
            cache.insert(SnapshotEntry {
                path: path.clone(),
                hash: file.hash.clone(),
                size: file.size,
                kind: EntryKind::File,
            });
        }
        cache
    }

    pub fn insert(&mut self, entry: SnapshotEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// File entries only, as `path -> hash`.
    pub fn file_hashes(&self) -> BTreeMap<String, String> {
        self.entries
            .values()
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| (entry.path.clone(), entry.hash.clone()))
            .collect()
    }

    /// Loads a snapshot. A missing or empty file is an empty snapshot; a
    /// directory or malformed content is a fatal format error.
    pub async fn load(path: &Path) -> Result<Self> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no snapshot at {:?}; treating as never synced", path);
                return Ok(Self::new());
            }
            Err(error) => return Err(error.into()),
        };

        if metadata.is_dir() {
            return Err(SyncError::CacheFormat(format!(
                "snapshot path {:?} is a directory",
                path
            )));
        }

        let content = fs::read(path).await?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }

        let cache: Self = serde_json::from_slice(&content).map_err(|error| {
            SyncError::CacheFormat(format!("snapshot {:?} is not valid: {}", path, error))
        })?;

        for (key, entry) in &cache.entries {
            if key != &entry.path {
                return Err(SyncError::CacheFormat(format!(
                    "snapshot key {} does not match entry path {}",
                    key, entry.path
                )));
            }
        }

        Ok(cache)
    }

    /// Writes the whole document to a temporary sibling, then renames it
    /// over `path`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if fs::metadata(path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
        {
            return Err(SyncError::CacheFormat(format!(
                "cannot write snapshot: {:?} is a directory",
                path
            )));
        }

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let payload = serde_json::to_vec_pretty(self)?;
        let temp_path = path.with_extension(format!("tmp-{}", ulid::Ulid::new()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&payload).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(error) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        tracing::debug!("saved snapshot with {} entries to {:?}", self.len(), path);
        Ok(())
    }
}
