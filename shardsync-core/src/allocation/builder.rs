use super::{Allocation, AllocationInner, AllocationState};
use crate::config::{AllocationConfig, CollaboratorConfig, CollaboratorPolicy, DispatcherConfig};
use crate::dispatcher::{DispatchHandler, RequestDispatcher, TransferHandler};
use crate::{
    BlobberClient, BlobberRef, CommitCoordinator, FileTransfer, HttpBlobberClient, Result,
    SyncError,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct AllocationBuilder {
    allocation_id: Option<String>,
    client_id: Option<String>,
    blobbers: Option<Vec<BlobberRef>>,
    data_shards: Option<usize>,
    parity_shards: Option<usize>,
    dispatcher: Option<DispatcherConfig>,
    commit_queue_depth: Option<usize>,
    collaborator: Option<CollaboratorConfig>,
    request_timeout: Option<Duration>,
    client: Option<Arc<dyn BlobberClient>>,
    transfer: Option<Arc<dyn FileTransfer>>,
    handler: Option<Arc<dyn DispatchHandler>>,
}

impl AllocationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AllocationConfig) -> Self {
        Self {
            allocation_id: Some(config.allocation_id.clone()),
            client_id: config.client_id.clone(),
            blobbers: Some(config.blobbers.clone()),
            data_shards: Some(config.data_shards),
            parity_shards: Some(config.parity_shards),
            dispatcher: Some(config.dispatcher.clone()),
            commit_queue_depth: Some(config.commit_queue_depth),
            collaborator: Some(config.collaborator.clone()),
            request_timeout: Some(Duration::from_secs(config.request_timeout_secs)),
            ..Self::default()
        }
    }

    pub fn allocation_id(mut self, allocation_id: impl Into<String>) -> Self {
        self.allocation_id = Some(allocation_id.into());
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn blobbers(mut self, blobbers: Vec<BlobberRef>) -> Self {
        self.blobbers = Some(blobbers);
        self
    }

    pub fn data_shards(mut self, data_shards: usize) -> Self {
        self.data_shards = Some(data_shards);
        self
    }

    pub fn parity_shards(mut self, parity_shards: usize) -> Self {
        self.parity_shards = Some(parity_shards);
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn commit_queue_depth(mut self, depth: usize) -> Self {
        self.commit_queue_depth = Some(depth);
        self
    }

    pub fn collaborator(mut self, collaborator: CollaboratorConfig) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Overrides the HTTP blobber client.
    pub fn client(mut self, client: Arc<dyn BlobberClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn transfer(mut self, transfer: Arc<dyn FileTransfer>) -> Self {
        self.transfer = Some(transfer);
        self
    }

    /// Replaces the default [`TransferHandler`] behind the dispatcher.
    pub fn dispatch_handler(mut self, handler: Arc<dyn DispatchHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn resolve_allocation_id(&self) -> Result<String> {
        let allocation_id = self
            .allocation_id
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if allocation_id.is_empty() {
            return Err(SyncError::Config(
                "allocation id cannot be empty".to_string(),
            ));
        }

        Ok(allocation_id)
    }

    fn resolve_blobbers(&self) -> Result<Vec<BlobberRef>> {
        let blobbers = self.blobbers.clone().unwrap_or_default();
        if blobbers.is_empty() {
            return Err(SyncError::Config(
                "allocation needs at least one blobber".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(blobbers.len());
        for blobber in &blobbers {
            if blobber.id.trim().is_empty() {
                return Err(SyncError::Config("blobber id cannot be empty".to_string()));
            }
            if blobber.base_url.trim().is_empty() {
                return Err(SyncError::Config(format!(
                    "blobber {} has no base url",
                    blobber.id
                )));
            }
            if !seen.insert(blobber.id.as_str()) {
                return Err(SyncError::Config(format!(
                    "blobber {} is listed twice",
                    blobber.id
                )));
            }
        }

        Ok(blobbers)
    }

    fn resolve_shards(&self, blobber_count: usize) -> Result<(usize, usize)> {
        let data_shards = self.data_shards.unwrap_or_default();
        if data_shards == 0 {
            return Err(SyncError::Config(
                "data shards must be at least 1".to_string(),
            ));
        }

        let parity_shards = self.parity_shards.unwrap_or_default();
        if data_shards + parity_shards != blobber_count {
            return Err(SyncError::Config(format!(
                "data shards ({}) + parity shards ({}) must equal blobber count ({})",
                data_shards, parity_shards, blobber_count
            )));
        }

        Ok((data_shards, parity_shards))
    }

    fn resolve_collaborator(&self, blobber_count: usize) -> Result<CollaboratorConfig> {
        let collaborator = self.collaborator.clone().unwrap_or_default();
        if let CollaboratorPolicy::Quorum(quorum) = collaborator.policy {
            if quorum == 0 || quorum > blobber_count {
                return Err(SyncError::Config(format!(
                    "collaborator quorum {} must be between 1 and {}",
                    quorum, blobber_count
                )));
            }
        }

        Ok(collaborator)
    }

    fn resolve_client(&self, allocation_id: &str) -> Result<Arc<dyn BlobberClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }

        let timeout = self.request_timeout.unwrap_or(Duration::from_secs(30));
        let client = HttpBlobberClient::new(allocation_id, self.client_id.clone(), timeout)?;
        Ok(Arc::new(client))
    }

    /// Validates the settings and starts the allocation's dispatcher task.
    pub async fn build(&self) -> Result<Allocation> {
        let id = self.resolve_allocation_id()?;
        let blobbers = self.resolve_blobbers()?;
        let (data_shards, parity_shards) = self.resolve_shards(blobbers.len())?;
        let collaborator = self.resolve_collaborator(blobbers.len())?;
        let client = self.resolve_client(&id)?;
        let dispatcher_config = self.dispatcher.clone().unwrap_or_default();
        let commit_queue_depth = self.commit_queue_depth.unwrap_or(1);
        if commit_queue_depth == 0 {
            return Err(SyncError::Config(
                "commit queue depth must be at least 1".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let commits = Arc::new(CommitCoordinator::new(
            client.clone(),
            commit_queue_depth,
            cancel.child_token(),
        ));
        let state = Arc::new(Mutex::new(AllocationState {
            blobbers,
            ..Default::default()
        }));

        let handler: Arc<dyn DispatchHandler> = match &self.handler {
            Some(handler) => handler.clone(),
            None => Arc::new(TransferHandler::new(
                id.clone(),
                data_shards,
                state.clone(),
                self.transfer.clone(),
                commits.clone(),
            )),
        };
        let (dispatcher, senders) =
            RequestDispatcher::new(handler, &dispatcher_config, cancel.child_token());
        let dispatcher = tokio::spawn(dispatcher.run());

        tracing::info!(
            "allocation ready. id={} data_shards={} parity_shards={}",
            id,
            data_shards,
            parity_shards
        );

        Ok(Allocation {
            inner: Arc::new(AllocationInner {
                id,
                data_shards,
                parity_shards,
                collaborator,
                client,
                state,
                commits,
                senders,
                cancel,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }
}
