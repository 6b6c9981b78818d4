use crate::{BlobberRef, Result, ShardCommit, StatusCallback};
use async_trait::async_trait;
use std::path::Path;

/// Shard movement for whole files.
///
/// Implementations own erasure coding and transaction signing. `upload`
/// writes shards to `targets` only and returns one signed commit per
/// target; the dispatcher commits them through the per-blobber workers.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn upload(
        &self,
        allocation_id: &str,
        targets: &[BlobberRef],
        local_path: &Path,
        remote_path: &str,
        status: &dyn StatusCallback,
    ) -> Result<Vec<ShardCommit>>;

    /// Reassembles `remote_path` from `blobbers` into `local_path` and
    /// returns the number of bytes written.
    async fn download(
        &self,
        allocation_id: &str,
        blobbers: &[BlobberRef],
        local_path: &Path,
        remote_path: &str,
        status: &dyn StatusCallback,
    ) -> Result<u64>;
}
