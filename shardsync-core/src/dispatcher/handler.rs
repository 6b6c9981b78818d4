use super::{DispatchHandler, DownloadRequest, RepairFileRequest, UploadRequest};
use crate::allocation::{AllocationState, TransferProgress};
use crate::{
    BlobberRef, CommitCoordinator, FileTransfer, OpKind, Result, StatusCallback, SyncError,
};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Default handler: moves shards through the configured [`FileTransfer`]
/// and commits them through the allocation's commit workers.
pub struct TransferHandler {
    allocation_id: String,
    data_shards: usize,
    state: Arc<Mutex<AllocationState>>,
    transfer: Option<Arc<dyn FileTransfer>>,
    commits: Arc<CommitCoordinator>,
}

impl TransferHandler {
    pub(crate) fn new(
        allocation_id: String,
        data_shards: usize,
        state: Arc<Mutex<AllocationState>>,
        transfer: Option<Arc<dyn FileTransfer>>,
        commits: Arc<CommitCoordinator>,
    ) -> Self {
        Self {
            allocation_id,
            data_shards,
            state,
            transfer,
            commits,
        }
    }

    fn blobbers(&self) -> Result<Vec<BlobberRef>> {
        self.state
            .lock()
            .map(|state| state.blobbers.clone())
            .map_err(|_| SyncError::Internal("allocation state poisoned".to_string()))
    }

    fn transfer(&self) -> Result<Arc<dyn FileTransfer>> {
        self.transfer
            .clone()
            .ok_or_else(|| SyncError::Config("no file transfer configured".to_string()))
    }

    fn track(&self, op: OpKind, local_path: &Path, remote_path: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.progress.insert(
                (op, remote_path.to_string()),
                TransferProgress {
                    local_path: local_path.to_path_buf(),
                    remote_path: remote_path.to_string(),
                    op,
                    started_at: chrono::Utc::now(),
                },
            );
        }
    }

    fn untrack(&self, op: OpKind, remote_path: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.progress.remove(&(op, remote_path.to_string()));
        }
    }

    /// Runs `work` while the request is listed as in progress, then reports
    /// the outcome to `status`.
    async fn tracked<F>(
        &self,
        op: OpKind,
        local_path: &Path,
        remote_path: &str,
        status: &dyn StatusCallback,
        work: F,
    ) -> Result<()>
    where
        F: Future<Output = Result<u64>> + Send,
    {
        self.track(op, local_path, remote_path);
        let outcome = work.await;
        self.untrack(op, remote_path);

        match outcome {
            Ok(size) => {
                status.completed(&self.allocation_id, remote_path, op, size);
                Ok(())
            }
            Err(error) => {
                tracing::error!("{} failed. path={} error={}", op, remote_path, error);
                status.error(&self.allocation_id, remote_path, op, &error);
                Err(error)
            }
        }
    }

    /// Uploads shards to `targets` and succeeds when at least `required`
    /// of their commits land.
    async fn push(
        &self,
        op: OpKind,
        targets: &[BlobberRef],
        required: usize,
        local_path: &Path,
        remote_path: &str,
        status: &dyn StatusCallback,
    ) -> Result<u64> {
        let transfer = self.transfer()?;
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|error| SyncError::Path(format!("local file {:?}: {}", local_path, error)))?
            .len();
        status.started(&self.allocation_id, remote_path, op, size);

        let shard_commits = transfer
            .upload(&self.allocation_id, targets, local_path, remote_path, status)
            .await?;

        let mut batch = Vec::with_capacity(shard_commits.len());
        for shard_commit in shard_commits {
            match targets.iter().find(|target| target.id == shard_commit.blobber_id) {
                Some(target) => batch.push((target.clone(), shard_commit.payload)),
                None => tracing::warn!(
                    "dropping commit for blobber outside the target set. blobber={} path={}",
                    shard_commit.blobber_id,
                    remote_path
                ),
            }
        }

        let results = self.commits.commit_all(batch).await;
        let mut succeeded = 0;
        for result in &results {
            status.commit_meta_completed(
                &result.connection_id,
                result.response.as_deref().unwrap_or_default(),
                result.error.as_deref(),
            );
            if result.success {
                succeeded += 1;
            }
        }

        if succeeded < required {
            return Err(SyncError::consensus(
                remote_path,
                format!(
                    "{} of {} commits succeeded, need {}",
                    succeeded,
                    targets.len(),
                    required
                ),
            ));
        }

        tracing::info!("{} committed. path={} commits={}", op, remote_path, succeeded);
        Ok(size)
    }
}

#[async_trait]
impl DispatchHandler for TransferHandler {
    async fn upload(&self, request: &UploadRequest) -> Result<()> {
        let status = request.status.as_ref();
        self.tracked(
            OpKind::Upload,
            &request.local_path,
            &request.remote_path,
            status,
            async {
                let targets = self.blobbers()?;
                self.push(
                    OpKind::Upload,
                    &targets,
                    self.data_shards,
                    &request.local_path,
                    &request.remote_path,
                    status,
                )
                .await
            },
        )
        .await
    }

    async fn download(&self, request: &DownloadRequest) -> Result<()> {
        let status = request.status.as_ref();
        self.tracked(
            OpKind::Download,
            &request.local_path,
            &request.remote_path,
            status,
            async {
                let blobbers = self.blobbers()?;
                let transfer = self.transfer()?;
                if let Some(parent) = request.local_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                status.started(&self.allocation_id, &request.remote_path, OpKind::Download, 0);
                transfer
                    .download(
                        &self.allocation_id,
                        &blobbers,
                        &request.local_path,
                        &request.remote_path,
                        status,
                    )
                    .await
            },
        )
        .await
    }

    async fn repair(&self, request: &RepairFileRequest) -> Result<()> {
        let status = request.status.as_ref();
        self.tracked(
            OpKind::Repair,
            &request.local_path,
            &request.remote_path,
            status,
            async {
                let blobbers = self.blobbers()?;
                if request.found.len() != blobbers.len() {
                    return Err(SyncError::InvalidRequest(format!(
                        "found mask has {} entries for {} blobbers",
                        request.found.len(),
                        blobbers.len()
                    )));
                }

                let targets: Vec<BlobberRef> = blobbers
                    .into_iter()
                    .zip(&request.found)
                    .filter(|(_, found)| !**found)
                    .map(|(blobber, _)| blobber)
                    .collect();
                if targets.is_empty() {
                    tracing::debug!("nothing to repair. path={}", request.remote_path);
                    return Ok(0);
                }

                self.push(
                    OpKind::Repair,
                    &targets,
                    targets.len(),
                    &request.local_path,
                    &request.remote_path,
                    status,
                )
                .await
            },
        )
        .await
    }
}
