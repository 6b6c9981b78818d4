use crate::BlobberRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    pub allocation_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub blobbers: Vec<BlobberRef>,
    pub data_shards: usize,
    pub parity_shards: usize,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default = "default_commit_queue_depth")]
    pub commit_queue_depth: usize,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_upload_capacity")]
    pub upload_capacity: usize,
    #[serde(default = "default_download_capacity")]
    pub download_capacity: usize,
    #[serde(default = "default_repair_capacity")]
    pub repair_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            upload_capacity: default_upload_capacity(),
            download_capacity: default_download_capacity(),
            repair_capacity: default_repair_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    /// 0 means one in-flight call per blobber.
    #[serde(default)]
    pub max_concurrency: usize,
    #[serde(default)]
    pub policy: CollaboratorPolicy,
}

/// Success rule for collaborator fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorPolicy {
    /// Every blobber must accept the change.
    #[default]
    All,
    /// At least `n` blobbers must accept the change.
    Quorum(usize),
}

impl CollaboratorPolicy {
    pub fn is_met(&self, succeeded: usize, total: usize) -> bool {
        match self {
            Self::All => total > 0 && succeeded == total,
            Self::Quorum(n) => succeeded >= (*n).max(1),
        }
    }
}

fn default_commit_queue_depth() -> usize {
    1
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_upload_capacity() -> usize {
    10
}

fn default_download_capacity() -> usize {
    10
}

fn default_repair_capacity() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let raw = r#"{
            "allocation_id": "alloc",
            "blobbers": [{"id": "b1", "base_url": "http://127.0.0.1:1"}],
            "data_shards": 1,
            "parity_shards": 0
        }"#;
        let config: AllocationConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.commit_queue_depth, 1);
        assert_eq!(config.dispatcher.upload_capacity, 10);
        assert_eq!(config.dispatcher.repair_capacity, 1);
        assert_eq!(config.collaborator.policy, CollaboratorPolicy::All);
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_collaborator_policy() {
        assert!(CollaboratorPolicy::All.is_met(4, 4));
        assert!(!CollaboratorPolicy::All.is_met(3, 4));
        assert!(!CollaboratorPolicy::All.is_met(0, 0));
        assert!(CollaboratorPolicy::Quorum(3).is_met(3, 4));
        assert!(!CollaboratorPolicy::Quorum(3).is_met(2, 4));
    }
}
