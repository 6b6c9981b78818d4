use crate::config::{CollaboratorConfig, CollaboratorPolicy};
use crate::paths::normalize_remote_path;
use crate::{BlobberClient, BlobberRef, Result, SyncError};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorAction {
    Add,
    Remove,
}

impl fmt::Display for CollaboratorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollaboratorOperationRequest {
    pub action: CollaboratorAction,
    pub path: String,
    pub collaborator_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobberOutcome {
    pub blobber_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Applies one collaborator change on every blobber of an allocation.
#[derive(Clone)]
pub struct CollaboratorOperation {
    client: Arc<dyn BlobberClient>,
    blobbers: Vec<BlobberRef>,
    config: CollaboratorConfig,
}

impl CollaboratorOperation {
    pub fn new(
        client: Arc<dyn BlobberClient>,
        blobbers: Vec<BlobberRef>,
        config: CollaboratorConfig,
    ) -> Self {
        Self {
            client,
            blobbers,
            config,
        }
    }

    /// One outcome per blobber, in blobber order.
    pub async fn fan_out(&self, request: &CollaboratorOperationRequest) -> Result<Vec<BlobberOutcome>> {
        let path = normalize_remote_path(&request.path)?;
        let collaborator_id = request.collaborator_id.trim();
        if collaborator_id.is_empty() {
            return Err(SyncError::InvalidRequest(
                "collaborator id cannot be empty".to_string(),
            ));
        }

        let limit = match self.config.max_concurrency {
            0 => self.blobbers.len().max(1),
            limit => limit,
        };
        let action = request.action;

        let outcomes = stream::iter(self.blobbers.iter())
            .map(|blobber| {
                let path = path.as_str();
                async move {
                    let result = match action {
                        CollaboratorAction::Add => {
                            self.client
                                .add_collaborator(blobber, path, collaborator_id)
                                .await
                        }
                        CollaboratorAction::Remove => {
                            self.client
                                .remove_collaborator(blobber, path, collaborator_id)
                                .await
                        }
                    };
                    match result {
                        Ok(()) => BlobberOutcome {
                            blobber_id: blobber.id.clone(),
                            success: true,
                            error: None,
                        },
                        Err(error) => {
                            tracing::warn!(
                                "collaborator {} failed. blobber={} path={} error={}",
                                action,
                                blobber.id,
                                path,
                                error
                            );
                            BlobberOutcome {
                                blobber_id: blobber.id.clone(),
                                success: false,
                                error: Some(error.to_string()),
                            }
                        }
                    }
                }
            })
            .buffered(limit)
            .collect::<Vec<_>>()
            .await;

        Ok(outcomes)
    }

    /// Aggregates [`Self::fan_out`] under the configured policy. Invalid
    /// input counts as failure.
    pub async fn run(&self, request: CollaboratorOperationRequest) -> bool {
        let outcomes = match self.fan_out(&request).await {
            Ok(outcomes) => outcomes,
            Err(error) => {
                tracing::error!("collaborator {} rejected. error={}", request.action, error);
                return false;
            }
        };

        let succeeded = outcomes.iter().filter(|outcome| outcome.success).count();
        let met = self.policy().is_met(succeeded, outcomes.len());
        tracing::info!(
            "collaborator {} finished. path={} succeeded={}/{} ok={}",
            request.action,
            request.path,
            succeeded,
            outcomes.len(),
            met
        );
        met
    }

    fn policy(&self) -> CollaboratorPolicy {
        self.config.policy
    }
}
