use super::diff::normalize_excludes;
use crate::consensus::ConsensusReader;
use crate::{Result, SnapshotCache, SyncError};
use std::path::PathBuf;

#[derive(Clone)]
pub struct SaveRemoteSnapshotOperation {
    reader: ConsensusReader,
}

#[derive(Debug, Clone)]
pub struct SaveRemoteSnapshotOperationRequest {
    pub path: PathBuf,
    pub remote_excludes: Vec<String>,
}

impl SaveRemoteSnapshotOperation {
    pub fn new(reader: ConsensusReader) -> Self {
        Self { reader }
    }

    pub async fn run(&self, request: SaveRemoteSnapshotOperationRequest) -> Result<SnapshotCache> {
        let SaveRemoteSnapshotOperationRequest {
            path,
            remote_excludes,
        } = request;

        if tokio::fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
        {
            return Err(SyncError::CacheFormat(format!(
                "cannot write snapshot: {:?} is a directory",
                path
            )));
        }
        let excludes = normalize_excludes(&remote_excludes)?;

        let mut tree = self.reader.remote_tree("/").await?;
        tree.exclude(&excludes);
        if !tree.unresolved.is_empty() {
            tracing::warn!(
                "leaving unresolved paths out of the snapshot. count={}",
                tree.unresolved.len()
            );
        }

        let cache = SnapshotCache::from_remote_tree(&tree);
        cache.save(&path).await?;
        tracing::info!("remote snapshot saved. path={:?} entries={}", path, cache.len());
        Ok(cache)
    }
}
