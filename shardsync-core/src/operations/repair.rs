//! Walks a remote subtree and re-seeds files that lack full redundancy.

use crate::local::{file_exists, hash_file};
use crate::paths::local_path_for;
use crate::{Allocation, EntryKind, ListResult, Result, StatusCallback, SyncError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairState {
    Walking,
    CheckingFile,
    Downloading,
    Repairing,
    Cancelled,
    Done,
}

pub type RepairCompletedCallback = Box<dyn FnOnce() + Send>;

pub struct RepairRequest {
    root: ListResult,
    local_root: PathBuf,
    status: Arc<dyn StatusCallback>,
    cancelled: Arc<AtomicBool>,
    cancel_reported: bool,
    completed: Option<RepairCompletedCallback>,
    files_repaired: usize,
    state: RepairState,
}

impl RepairRequest {
    /// `root` may be a file or a directory; directories without children
    /// are listed from the blobbers as the walk reaches them.
    pub fn new(
        root: ListResult,
        local_root: impl Into<PathBuf>,
        status: Arc<dyn StatusCallback>,
    ) -> Self {
        Self {
            root,
            local_root: local_root.into(),
            status,
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_reported: false,
            completed: None,
            files_repaired: 0,
            state: RepairState::Walking,
        }
    }

    pub fn with_completed(mut self, callback: RepairCompletedCallback) -> Self {
        self.completed = Some(callback);
        self
    }

    pub fn state(&self) -> RepairState {
        self.state
    }

    pub fn files_repaired(&self) -> usize {
        self.files_repaired
    }

    /// Sets the cancel flag. Cancellation cannot be undone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Runs the walk to completion or cancellation and returns the number
    /// of files repaired. `repair_completed` is reported exactly once,
    /// followed by the completion callback.
    pub async fn process_repair(mut self, allocation: &Allocation) -> usize {
        tracing::info!(
            "repair started. allocation={} root={}",
            allocation.id(),
            self.root.path
        );

        if !self.check_for_cancel(allocation) {
            self.walk(allocation).await;
        }

        self.state = if self.cancel_reported {
            RepairState::Cancelled
        } else {
            RepairState::Done
        };
        tracing::info!(
            "repair finished. root={} state={:?} files_repaired={}",
            self.root.path,
            self.state,
            self.files_repaired
        );

        self.status.repair_completed(self.files_repaired);
        if let Some(callback) = self.completed.take() {
            callback();
        }
        self.files_repaired
    }

    /// Reports `repair_cancelled` the first time cancellation is seen.
    fn check_for_cancel(&mut self, allocation: &Allocation) -> bool {
        if self.cancel_reported {
            return true;
        }
        if self.cancelled.load(Ordering::SeqCst) || allocation.is_cancelled() {
            self.cancel_reported = true;
            self.state = RepairState::Cancelled;
            tracing::info!("repair cancelled. root={}", self.root.path);
            self.status.repair_cancelled();
            return true;
        }
        false
    }

    async fn walk(&mut self, allocation: &Allocation) {
        let mut pending = vec![self.root.clone()];

        while let Some(node) = pending.pop() {
            if self.check_for_cancel(allocation) {
                return;
            }

            if node.kind == EntryKind::File {
                self.repair_file(allocation, &node).await;
                continue;
            }

            self.state = RepairState::Walking;
            let (dir, unresolved) = if node.children.is_empty() {
                match allocation.list_dir(&node.path).await {
                    Ok(consensus) => (consensus.listing, consensus.unresolved),
                    Err(error) => {
                        tracing::error!("skipping subtree. path={} error={}", node.path, error);
                        continue;
                    }
                }
            } else {
                (node, Vec::new())
            };

            if !dir.is_dir() {
                self.repair_file(allocation, &dir).await;
                continue;
            }

            tracing::debug!(
                "walking directory {} children={} unresolved={}",
                dir.path,
                dir.children.len(),
                unresolved.len()
            );
            // Unresolved entries are revisited on their own: directories are
            // listed again, files get the per-file check.
            pending.extend(unresolved.into_iter().rev());
            pending.extend(dir.children.into_iter().rev());
        }
    }

    async fn repair_file(&mut self, allocation: &Allocation, file: &ListResult) {
        if self.check_for_cancel(allocation) {
            return;
        }
        self.state = RepairState::CheckingFile;

        let check = match allocation.repair_required(&file.path).await {
            Ok(check) => check,
            Err(error) => {
                tracing::error!("repair check failed. path={} error={}", file.path, error);
                return;
            }
        };
        if !check.required {
            return;
        }
        tracing::info!(
            "file needs repair. path={} holders={}/{}",
            file.path,
            check.holders(),
            check.found.len()
        );

        let local_path = local_path_for(&self.local_root, &file.path);
        if !file_exists(&local_path) {
            if self.check_for_cancel(allocation) {
                return;
            }
            self.state = RepairState::Downloading;
            if let Err(error) = allocation
                .download_file(&local_path, &file.path, self.status.clone())
                .await
            {
                tracing::error!("download for repair failed. path={} error={}", file.path, error);
                return;
            }
        }

        if let Err(error) = verify_local_copy(&local_path, &check.file).await {
            tracing::error!("local copy unusable for repair. path={} error={}", file.path, error);
            return;
        }

        if self.check_for_cancel(allocation) {
            return;
        }
        self.state = RepairState::Repairing;
        match allocation
            .repair_file(&local_path, &file.path, check.found, self.status.clone())
            .await
        {
            Ok(()) => {
                self.files_repaired += 1;
                tracing::info!("repair success. path={}", file.path);
            }
            Err(error) => {
                tracing::error!("repair failed. path={} error={}", file.path, error);
            }
        }
    }
}

/// A local copy may only seed blobbers when it is the agreed remote copy.
async fn verify_local_copy(local_path: &Path, agreed: &ListResult) -> Result<()> {
    let path = local_path.to_path_buf();
    let (hash, size) = tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|error| SyncError::Internal(format!("hash task failed: {}", error)))??;

    if hash != agreed.hash || size != agreed.size {
        return Err(SyncError::consensus(
            &agreed.path,
            format!(
                "local copy {}:{} differs from agreed {}:{}",
                hash, size, agreed.hash, agreed.size
            ),
        ));
    }
    Ok(())
}

/// Handle to a repair walk running on its own task.
pub struct RepairHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<usize>,
}

impl RepairHandle {
    pub(crate) fn spawn(allocation: Allocation, request: RepairRequest) -> Self {
        let cancelled = request.cancel_flag();
        let task = tokio::spawn(async move { request.process_repair(&allocation).await });
        Self { cancelled, task }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the walk and returns the number of files repaired.
    pub async fn wait(self) -> Result<usize> {
        self.task
            .await
            .map_err(|error| SyncError::Internal(format!("repair task failed: {}", error)))
    }
}
