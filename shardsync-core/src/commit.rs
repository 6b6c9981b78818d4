//! Per-blobber metadata commit workers.
//!
//! Each blobber gets one worker task and one bounded queue, created on the
//! first commit for that blobber and kept until the coordinator shuts down.
//! A worker handles one request at a time, so commits to the same blobber
//! complete in enqueue order while different blobbers proceed in parallel.

use crate::{BlobberClient, BlobberRef, CommitPayload, Result, SyncError};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct CommitRequest {
    pub blobber_id: String,
    pub payload: CommitPayload,
    reply: oneshot::Sender<CommitResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub blobber_id: String,
    pub connection_id: String,
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl CommitResult {
    fn failed(blobber_id: &str, connection_id: &str, error: &SyncError) -> Self {
        Self {
            blobber_id: blobber_id.to_string(),
            connection_id: connection_id.to_string(),
            success: false,
            response: None,
            error: Some(error.to_string()),
        }
    }
}

struct CommitWorker {
    sender: mpsc::Sender<CommitRequest>,
    handle: JoinHandle<()>,
}

pub struct CommitCoordinator {
    client: Arc<dyn BlobberClient>,
    queue_depth: usize,
    workers: Mutex<HashMap<String, CommitWorker>>,
    cancel: CancellationToken,
}

impl CommitCoordinator {
    pub fn new(client: Arc<dyn BlobberClient>, queue_depth: usize, cancel: CancellationToken) -> Self {
        Self {
            client,
            queue_depth: queue_depth.max(1),
            workers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|workers| workers.len()).unwrap_or(0)
    }

    /// Enqueues a commit and waits for its result. Waits for queue space
    /// when the blobber's worker is busy.
    pub async fn submit(&self, blobber: &BlobberRef, payload: CommitPayload) -> Result<CommitResult> {
        let sender = self.sender_for(blobber)?;
        let (reply, receiver) = oneshot::channel();

        sender
            .send(CommitRequest {
                blobber_id: blobber.id.clone(),
                payload,
                reply,
            })
            .await
            .map_err(|_| SyncError::ChannelClosed(format!("commit queue for {}", blobber.id)))?;

        receiver
            .await
            .map_err(|_| SyncError::ChannelClosed(format!("commit worker for {}", blobber.id)))
    }

    /// Commits a batch, one entry per blobber, and returns results in input
    /// order. Enqueue failures become failed results.
    pub async fn commit_all(&self, commits: Vec<(BlobberRef, CommitPayload)>) -> Vec<CommitResult> {
        join_all(commits.into_iter().map(|(blobber, payload)| async move {
            let connection_id = payload.connection_id.clone();
            match self.submit(&blobber, payload).await {
                Ok(result) => result,
                Err(error) => CommitResult::failed(&blobber.id, &connection_id, &error),
            }
        }))
        .await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut workers) = self.workers.lock() {
            for (_, worker) in workers.drain() {
                worker.handle.abort();
            }
        }
    }

    fn sender_for(&self, blobber: &BlobberRef) -> Result<mpsc::Sender<CommitRequest>> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut workers = self
            .workers
            .lock()
            .map_err(|_| SyncError::Internal("commit worker registry poisoned".to_string()))?;

        if let Some(worker) = workers.get(&blobber.id) {
            if !worker.sender.is_closed() {
                return Ok(worker.sender.clone());
            }
        }

        let (sender, receiver) = mpsc::channel(self.queue_depth);
        let handle = tokio::spawn(run_worker(
            self.client.clone(),
            blobber.clone(),
            receiver,
            self.cancel.clone(),
        ));
        tracing::debug!("started commit worker for blobber {}", blobber.id);
        workers.insert(
            blobber.id.clone(),
            CommitWorker {
                sender: sender.clone(),
                handle,
            },
        );
        Ok(sender)
    }
}

impl Drop for CommitCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    client: Arc<dyn BlobberClient>,
    blobber: BlobberRef,
    mut receiver: mpsc::Receiver<CommitRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = match client.commit(&blobber, &request.payload).await {
            Ok(response) => CommitResult {
                blobber_id: request.blobber_id.clone(),
                connection_id: request.payload.connection_id.clone(),
                success: true,
                response: Some(response),
                error: None,
            },
            Err(error) => {
                tracing::warn!(
                    "commit failed. blobber={} connection_id={} error={}",
                    blobber.id,
                    request.payload.connection_id,
                    error
                );
                CommitResult::failed(&request.blobber_id, &request.payload.connection_id, &error)
            }
        };

        let _ = request.reply.send(result);
    }

    tracing::debug!("commit worker for blobber {} stopped", blobber.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::testing::{MemoryBlobbers, blobbers};

    #[tokio::test]
    async fn test_commits_to_one_blobber_keep_order() {
        let refs = blobbers(1);
        let memory = Arc::new(MemoryBlobbers::default());
        let coordinator = Arc::new(CommitCoordinator::new(memory.clone(), 1, CancellationToken::new()));

        for index in 0..5 {
            let payload = CommitPayload::new(serde_json::json!({ "seq": index }));
            let result = coordinator.submit(&refs[0], payload).await.unwrap();
            assert!(result.success);
        }

        let commits = memory.commits.lock().unwrap();
        let seqs: Vec<i64> = commits
            .iter()
            .map(|(_, payload)| payload.write_marker["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(coordinator.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_all_reports_each_blobber() {
        let refs = blobbers(4);
        let memory = Arc::new(MemoryBlobbers::default());
        memory.set_offline(&refs[2].id);
        let coordinator = CommitCoordinator::new(memory.clone(), 1, CancellationToken::new());

        let batch = refs
            .iter()
            .map(|blobber| (blobber.clone(), CommitPayload::new(serde_json::json!({}))))
            .collect();
        let results = coordinator.commit_all(batch).await;

        assert_eq!(results.len(), 4);
        let flags: Vec<bool> = results.iter().map(|result| result.success).collect();
        assert_eq!(flags, vec![true, true, false, true]);
        assert_eq!(results[2].blobber_id, refs[2].id);
        assert!(results[2].error.is_some());
        assert_eq!(coordinator.worker_count(), 4);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_cancelled() {
        let refs = blobbers(1);
        let memory = Arc::new(MemoryBlobbers::default());
        let coordinator = CommitCoordinator::new(memory, 1, CancellationToken::new());
        coordinator.shutdown();

        let error = coordinator
            .submit(&refs[0], CommitPayload::new(serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(error, SyncError::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_submits_to_one_blobber_all_complete() {
        let refs = blobbers(1);
        let memory = Arc::new(MemoryBlobbers::default());
        let coordinator = Arc::new(CommitCoordinator::new(memory.clone(), 1, CancellationToken::new()));

        let tasks: Vec<_> = (0..8)
            .map(|index| {
                let coordinator = coordinator.clone();
                let blobber = refs[0].clone();
                tokio::spawn(async move {
                    coordinator
                        .submit(&blobber, CommitPayload::new(serde_json::json!({ "seq": index })))
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().unwrap().success);
        }
        assert_eq!(memory.commits.lock().unwrap().len(), 8);
    }
}
