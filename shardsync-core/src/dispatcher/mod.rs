//! Serializes upload, download and repair requests for one allocation.
//!
//! The router owns the receiving ends of three bounded channels and hands
//! each request to a [`DispatchHandler`]. Requests are processed one at a
//! time; the allocation's progress state is only touched from here.

mod handler;

pub use handler::TransferHandler;

use crate::config::DispatcherConfig;
use crate::{Result, StatusCallback, SyncError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Invoked with the remote path once a request has been handled. Handlers
/// borrow whole requests across awaits, so the callback must be `Sync`.
pub type CompletedCallback = Box<dyn FnOnce(&str) + Send + Sync>;

/// Fires with the handler's outcome after the completion callback ran.
pub type CompletionSignal = oneshot::Sender<Result<()>>;

pub struct UploadRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: Arc<dyn StatusCallback>,
    pub completed: Option<CompletedCallback>,
    pub done: Option<CompletionSignal>,
}

pub struct DownloadRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: Arc<dyn StatusCallback>,
    pub completed: Option<CompletedCallback>,
    pub done: Option<CompletionSignal>,
}

/// Re-seeds one file onto the blobbers whose `found` flag is false.
pub struct RepairFileRequest {
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Per blobber, in allocation order.
    pub found: Vec<bool>,
    pub status: Arc<dyn StatusCallback>,
    pub completed: Option<CompletedCallback>,
    pub done: Option<CompletionSignal>,
}

#[async_trait]
pub trait DispatchHandler: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<()>;

    async fn download(&self, request: &DownloadRequest) -> Result<()>;

    async fn repair(&self, request: &RepairFileRequest) -> Result<()>;
}

/// Sending halves of the dispatcher channels.
#[derive(Clone)]
pub struct RequestSenders {
    upload: mpsc::Sender<UploadRequest>,
    download: mpsc::Sender<DownloadRequest>,
    repair: mpsc::Sender<RepairFileRequest>,
}

impl RequestSenders {
    /// Waits for queue space when the upload channel is full.
    pub async fn upload(&self, request: UploadRequest) -> Result<()> {
        self.upload
            .send(request)
            .await
            .map_err(|_| SyncError::ChannelClosed("upload channel".to_string()))
    }

    pub async fn download(&self, request: DownloadRequest) -> Result<()> {
        self.download
            .send(request)
            .await
            .map_err(|_| SyncError::ChannelClosed("download channel".to_string()))
    }

    pub async fn repair(&self, request: RepairFileRequest) -> Result<()> {
        self.repair
            .send(request)
            .await
            .map_err(|_| SyncError::ChannelClosed("repair channel".to_string()))
    }
}

pub struct RequestDispatcher {
    handler: Arc<dyn DispatchHandler>,
    uploads: mpsc::Receiver<UploadRequest>,
    downloads: mpsc::Receiver<DownloadRequest>,
    repairs: mpsc::Receiver<RepairFileRequest>,
    cancel: CancellationToken,
}

impl RequestDispatcher {
    pub fn new(
        handler: Arc<dyn DispatchHandler>,
        config: &DispatcherConfig,
        cancel: CancellationToken,
    ) -> (Self, RequestSenders) {
        let (upload, uploads) = mpsc::channel(config.upload_capacity.max(1));
        let (download, downloads) = mpsc::channel(config.download_capacity.max(1));
        let (repair, repairs) = mpsc::channel(config.repair_capacity.max(1));

        let dispatcher = Self {
            handler,
            uploads,
            downloads,
            repairs,
            cancel,
        };
        let senders = RequestSenders {
            upload,
            download,
            repair,
        };
        (dispatcher, senders)
    }

    /// Routes requests until the token is cancelled or every sender is
    /// gone. Queued requests are dropped on cancellation, which closes
    /// their completion signals.
    pub async fn run(mut self) {
        tracing::debug!("request dispatcher started");
        let (mut uploads_open, mut downloads_open, mut repairs_open) = (true, true, true);
        while uploads_open || downloads_open || repairs_open {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("request dispatcher cancelled");
                    return;
                }
                request = self.uploads.recv(), if uploads_open => match request {
                    Some(request) => {
                        let outcome = self.handler.upload(&request).await;
                        finish(&request.remote_path, request.completed, request.done, outcome);
                    }
                    None => uploads_open = false,
                },
                request = self.downloads.recv(), if downloads_open => match request {
                    Some(request) => {
                        let outcome = self.handler.download(&request).await;
                        finish(&request.remote_path, request.completed, request.done, outcome);
                    }
                    None => downloads_open = false,
                },
                request = self.repairs.recv(), if repairs_open => match request {
                    Some(request) => {
                        let outcome = self.handler.repair(&request).await;
                        finish(&request.remote_path, request.completed, request.done, outcome);
                    }
                    None => repairs_open = false,
                },
            }
        }
        tracing::debug!("request dispatcher channels closed");
    }
}

fn finish(
    remote_path: &str,
    completed: Option<CompletedCallback>,
    done: Option<CompletionSignal>,
    outcome: Result<()>,
) {
    if let Err(error) = &outcome {
        tracing::debug!("request finished with error. path={} error={}", remote_path, error);
    }
    if let Some(callback) = completed {
        callback(remote_path);
    }
    if let Some(done) = done {
        let _ = done.send(outcome);
    }
}
