//! One erasure-coded allocation and the tasks that serve it.

mod builder;

pub use builder::AllocationBuilder;

use crate::config::{CollaboratorConfig, CollaboratorPolicy};
use crate::consensus::{ConsensusReader, DirConsensus, RepairCheck};
use crate::dispatcher::{DownloadRequest, RepairFileRequest, RequestSenders, UploadRequest};
use crate::operations::{
    BlobberOutcome, CollaboratorAction, CollaboratorOperation, CollaboratorOperationRequest,
    FileDiff, GetAllocationDiffOperation, GetAllocationDiffOperationRequest, RepairHandle,
    RepairRequest, SaveRemoteSnapshotOperation, SaveRemoteSnapshotOperationRequest,
};
use crate::paths::normalize_remote_path;
use crate::{
    BlobberClient, BlobberRef, CommitCoordinator, ListResult, OpKind, Result, SnapshotCache,
    StatusCallback, SyncError,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A transfer the dispatcher is currently handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub op: OpKind,
    pub started_at: DateTime<Utc>,
}

/// Mutable state shared between the allocation and its dispatcher.
#[derive(Debug, Default)]
pub(crate) struct AllocationState {
    pub(crate) blobbers: Vec<BlobberRef>,
    pub(crate) progress: HashMap<(OpKind, String), TransferProgress>,
}

/// Cheap-to-clone handle to an allocation.
#[derive(Clone)]
pub struct Allocation {
    inner: Arc<AllocationInner>,
}

struct AllocationInner {
    id: String,
    data_shards: usize,
    parity_shards: usize,
    collaborator: CollaboratorConfig,
    client: Arc<dyn BlobberClient>,
    state: Arc<Mutex<AllocationState>>,
    commits: Arc<CommitCoordinator>,
    senders: RequestSenders,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AllocationInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Allocation {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn data_shards(&self) -> usize {
        self.inner.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.inner.parity_shards
    }

    /// Number of identical answers needed to accept a remote value.
    pub fn consensus_threshold(&self) -> usize {
        self.inner.data_shards
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn commit_coordinator(&self) -> Arc<CommitCoordinator> {
        self.inner.commits.clone()
    }

    fn state(&self) -> Result<MutexGuard<'_, AllocationState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| SyncError::Internal("allocation state poisoned".to_string()))
    }

    pub fn blobbers(&self) -> Result<Vec<BlobberRef>> {
        Ok(self.state()?.blobbers.clone())
    }

    /// Replaces the blobber list, keeping the shard layout.
    pub fn set_blobbers(&self, blobbers: Vec<BlobberRef>) -> Result<()> {
        let expected = self.inner.data_shards + self.inner.parity_shards;
        if blobbers.len() != expected {
            return Err(SyncError::Config(format!(
                "allocation needs {} blobbers, got {}",
                expected,
                blobbers.len()
            )));
        }
        self.state()?.blobbers = blobbers;
        Ok(())
    }

    /// Transfers the dispatcher is handling right now.
    pub fn in_progress(&self) -> Result<Vec<TransferProgress>> {
        let mut progress: Vec<TransferProgress> =
            self.state()?.progress.values().cloned().collect();
        progress.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(progress)
    }

    fn consensus(&self) -> Result<ConsensusReader> {
        Ok(ConsensusReader::new(
            self.inner.client.clone(),
            self.blobbers()?,
            self.consensus_threshold(),
        ))
    }

    /// Agreed listing of one remote directory.
    pub async fn list_dir(&self, path: &str) -> Result<DirConsensus> {
        self.consensus()?.list_dir(path).await
    }

    pub async fn repair_required(&self, path: &str) -> Result<RepairCheck> {
        self.consensus()?.repair_required(path).await
    }

    pub async fn get_allocation_diff(
        &self,
        snapshot_path: &Path,
        local_root: &Path,
        local_filters: &[String],
        remote_excludes: &[String],
    ) -> Result<Vec<FileDiff>> {
        GetAllocationDiffOperation::new(self.consensus()?)
            .run(GetAllocationDiffOperationRequest {
                snapshot_path: snapshot_path.to_path_buf(),
                local_root: local_root.to_path_buf(),
                local_filters: local_filters.to_vec(),
                remote_excludes: remote_excludes.to_vec(),
            })
            .await
    }

    pub async fn save_remote_snapshot(
        &self,
        path: &Path,
        remote_excludes: &[String],
    ) -> Result<SnapshotCache> {
        SaveRemoteSnapshotOperation::new(self.consensus()?)
            .run(SaveRemoteSnapshotOperationRequest {
                path: path.to_path_buf(),
                remote_excludes: remote_excludes.to_vec(),
            })
            .await
    }

    pub async fn enqueue_upload(&self, request: UploadRequest) -> Result<()> {
        self.inner.senders.upload(request).await
    }

    pub async fn enqueue_download(&self, request: DownloadRequest) -> Result<()> {
        self.inner.senders.download(request).await
    }

    pub async fn enqueue_repair(&self, request: RepairFileRequest) -> Result<()> {
        self.inner.senders.repair(request).await
    }

    /// Uploads through the dispatcher and waits for the outcome.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        status: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let (done, signal) = oneshot::channel();
        self.enqueue_upload(UploadRequest {
            local_path: local_path.to_path_buf(),
            remote_path: normalize_remote_path(remote_path)?,
            status,
            completed: None,
            done: Some(done),
        })
        .await?;
        self.wait_for(signal, "upload").await
    }

    pub async fn download_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        status: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let (done, signal) = oneshot::channel();
        self.enqueue_download(DownloadRequest {
            local_path: local_path.to_path_buf(),
            remote_path: normalize_remote_path(remote_path)?,
            status,
            completed: None,
            done: Some(done),
        })
        .await?;
        self.wait_for(signal, "download").await
    }

    /// Re-seeds `remote_path` onto the blobbers whose `found` flag is false.
    pub async fn repair_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        found: Vec<bool>,
        status: Arc<dyn StatusCallback>,
    ) -> Result<()> {
        let (done, signal) = oneshot::channel();
        self.enqueue_repair(RepairFileRequest {
            local_path: local_path.to_path_buf(),
            remote_path: normalize_remote_path(remote_path)?,
            found,
            status,
            completed: None,
            done: Some(done),
        })
        .await?;
        self.wait_for(signal, "repair").await
    }

    async fn wait_for(&self, signal: oneshot::Receiver<Result<()>>, what: &str) -> Result<()> {
        match signal.await {
            Ok(outcome) => outcome,
            Err(_) if self.is_cancelled() => Err(SyncError::Cancelled),
            Err(_) => Err(SyncError::ChannelClosed(format!("{} completion", what))),
        }
    }

    /// Starts a repair walk of `remote_root` on its own task.
    pub fn start_repair(
        &self,
        local_root: impl Into<PathBuf>,
        remote_root: &str,
        status: Arc<dyn StatusCallback>,
    ) -> Result<RepairHandle> {
        let root = normalize_remote_path(remote_root)?;
        let request = RepairRequest::new(ListResult::directory(root), local_root, status);
        Ok(self.spawn_repair(request))
    }

    pub fn spawn_repair(&self, request: RepairRequest) -> RepairHandle {
        RepairHandle::spawn(self.clone(), request)
    }

    pub fn collaborator_policy(&self) -> CollaboratorPolicy {
        self.inner.collaborator.policy
    }

    fn collaborator_operation(&self) -> Result<CollaboratorOperation> {
        Ok(CollaboratorOperation::new(
            self.inner.client.clone(),
            self.blobbers()?,
            self.inner.collaborator.clone(),
        ))
    }

    /// Per-blobber detail of a collaborator change.
    pub async fn fan_out_outcomes(
        &self,
        action: CollaboratorAction,
        path: &str,
        collaborator_id: &str,
    ) -> Result<Vec<BlobberOutcome>> {
        self.collaborator_operation()?
            .fan_out(&CollaboratorOperationRequest {
                action,
                path: path.to_string(),
                collaborator_id: collaborator_id.to_string(),
            })
            .await
    }

    pub async fn update_collaborator_to_blobbers(&self, path: &str, collaborator_id: &str) -> bool {
        self.collaborator(CollaboratorAction::Add, path, collaborator_id)
            .await
    }

    pub async fn remove_collaborator_from_blobbers(
        &self,
        path: &str,
        collaborator_id: &str,
    ) -> bool {
        self.collaborator(CollaboratorAction::Remove, path, collaborator_id)
            .await
    }

    async fn collaborator(&self, action: CollaboratorAction, path: &str, collaborator_id: &str) -> bool {
        let operation = match self.collaborator_operation() {
            Ok(operation) => operation,
            Err(error) => {
                tracing::error!("collaborator {} not started. error={}", action, error);
                return false;
            }
        };
        operation
            .run(CollaboratorOperationRequest {
                action,
                path: path.to_string(),
                collaborator_id: collaborator_id.to_string(),
            })
            .await
    }

    /// Cancels the allocation, stops the commit workers and waits for the
    /// dispatcher to exit. Requests still queued are dropped.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.commits.shutdown();

        let handle = self
            .inner
            .dispatcher
            .lock()
            .ok()
            .and_then(|mut dispatcher| dispatcher.take());
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!("dispatcher task ended abnormally. error={}", error);
            }
        }
        tracing::info!("allocation {} shut down", self.inner.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::testing::{MemoryBlobbers, blobbers};
    use crate::status::testing::RecordingStatus;
    use crate::transfer::testing::MemoryTransfer;
    use crate::{DiffOp, NoopStatusCallback, compute_hash};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn allocation(memory: Arc<MemoryBlobbers>) -> (Allocation, Arc<MemoryTransfer>) {
        let transfer = Arc::new(MemoryTransfer::new(memory.clone()));
        let allocation = AllocationBuilder::new()
            .allocation_id("alloc")
            .blobbers(blobbers(4))
            .data_shards(2)
            .parity_shards(2)
            .client(memory)
            .transfer(transfer.clone())
            .build()
            .await
            .unwrap();
        (allocation, transfer)
    }

    #[tokio::test]
    async fn test_sync_then_diff_is_empty() {
        let memory = Arc::new(MemoryBlobbers::default());
        let (allocation, _transfer) = allocation(memory.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        std::fs::create_dir_all(local.join("docs")).unwrap();
        std::fs::write(local.join("docs/a.txt"), b"alpha").unwrap();
        std::fs::write(local.join("b.txt"), b"bravo").unwrap();
        let snapshot = dir.path().join("snapshot.json");

        let diffs = allocation
            .get_allocation_diff(&snapshot, &local, &[], &[])
            .await
            .unwrap();
        assert_eq!(
            diffs,
            vec![
                FileDiff::new("/b.txt", DiffOp::Upload),
                FileDiff::new("/docs/a.txt", DiffOp::Upload),
            ]
        );

        for diff in &diffs {
            let local_path = crate::paths::local_path_for(&local, &diff.path);
            allocation
                .upload_file(&local_path, &diff.path, Arc::new(NoopStatusCallback))
                .await
                .unwrap();
        }
        allocation.save_remote_snapshot(&snapshot, &[]).await.unwrap();

        let diffs = allocation
            .get_allocation_diff(&snapshot, &local, &[], &[])
            .await
            .unwrap();
        assert!(diffs.is_empty());

        let cached = SnapshotCache::load(&snapshot).await.unwrap();
        assert_eq!(cached.get("/b.txt").unwrap().hash, compute_hash(b"bravo"));
    }

    #[tokio::test]
    async fn test_upload_reports_through_status() {
        let memory = Arc::new(MemoryBlobbers::default());
        let (allocation, _transfer) = allocation(memory.clone()).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"alpha").unwrap();
        let status = Arc::new(RecordingStatus::default());

        allocation
            .upload_file(&local, "a.txt", status.clone())
            .await
            .unwrap();

        assert_eq!(status.events().last().unwrap(), "completed:upload:/a.txt");
        assert!(allocation.in_progress().unwrap().is_empty());
        assert_eq!(allocation.commit_coordinator().worker_count(), 4);
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail() {
        let memory = Arc::new(MemoryBlobbers::default());
        let (allocation, _transfer) = allocation(memory).await;
        allocation.shutdown().await;
        assert!(allocation.is_cancelled());

        let error = allocation
            .download_file(Path::new("/tmp/never"), "/never", Arc::new(NoopStatusCallback))
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::ChannelClosed(_)));
    }

    async fn http_blobber(files: &[(&str, &str, u64)]) -> MockServer {
        let server = MockServer::start().await;
        let list: Vec<serde_json::Value> = files
            .iter()
            .map(|(path, hash, size)| {
                serde_json::json!({
                    "path": path,
                    "name": path.trim_start_matches('/'),
                    "type": "f",
                    "actual_hash": hash,
                    "size": size,
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/v1/file/list/alloc"))
            .and(query_param("path", "/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "path": "/",
                "name": "/",
                "type": "d",
                "list": list,
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_diff_over_http_blobbers() {
        let three = compute_hash(b"three");
        let one = compute_hash(b"one");
        let mut servers = Vec::new();
        for index in 0..4 {
            let mut files = vec![("/3.txt", three.as_str(), 5)];
            if index == 0 {
                files.push(("/1.txt", one.as_str(), 3));
            }
            servers.push(http_blobber(&files).await);
        }
        let refs: Vec<BlobberRef> = servers
            .iter()
            .enumerate()
            .map(|(index, server)| BlobberRef::new(format!("blobber-{}", index + 1), server.uri()))
            .collect();
        let allocation = AllocationBuilder::new()
            .allocation_id("alloc")
            .client_id("client")
            .blobbers(refs)
            .data_shards(2)
            .parity_shards(2)
            .build()
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("3.txt"), b"three, edited").unwrap();
        let snapshot = dir.path().join("snapshot.json");
        std::fs::write(
            &snapshot,
            serde_json::to_vec(&serde_json::json!({
                "/3.txt": {"path": "/3.txt", "hash": three, "size": 5, "type": "f"}
            }))
            .unwrap(),
        )
        .unwrap();

        let diffs = allocation
            .get_allocation_diff(&snapshot, &local, &[], &[])
            .await
            .unwrap();
        assert_eq!(diffs, vec![FileDiff::new("/3.txt", DiffOp::Update)]);

        let requests = servers[0].received_requests().await.unwrap();
        let client_id = requests[0].headers.get("X-App-Client-ID").unwrap();
        assert_eq!(client_id.to_str().unwrap(), "client");
        allocation.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_blobbers_keeps_shard_layout() {
        let memory = Arc::new(MemoryBlobbers::default());
        let (allocation, _transfer) = allocation(memory).await;
        assert!(allocation.set_blobbers(blobbers(3)).is_err());
        allocation.set_blobbers(blobbers(4)).unwrap();
        assert_eq!(allocation.blobbers().unwrap().len(), 4);
    }
}
