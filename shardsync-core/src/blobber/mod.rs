//! Blobber-facing types and the client seam the engine talks through.

pub mod http;

pub use http::HttpBlobberClient;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobberRef {
    pub id: String,
    pub base_url: String,
}

impl BlobberRef {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "f")]
    File,
    #[serde(rename = "d")]
    Directory,
}

/// One node of a remote directory tree.
///
/// As returned by a single blobber this is that blobber's view; once it
/// has passed through consensus it is the agreed state of the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResult {
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, alias = "actual_hash")]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, rename = "list")]
    pub children: Vec<ListResult>,
}

impl ListResult {
    pub fn directory(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path).to_string(),
            path,
            kind: EntryKind::Directory,
            hash: String::new(),
            size: 0,
            children: Vec::new(),
        }
    }

    pub fn file(path: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path).to_string(),
            path,
            kind: EntryKind::File,
            hash: hash.into(),
            size,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<ListResult>) -> Self {
        self.children = children;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Metadata a blobber holds for a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(alias = "actual_hash")]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

/// An already signed metadata transaction for one blobber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    pub connection_id: String,
    pub write_marker: serde_json::Value,
}

impl CommitPayload {
    pub fn new(write_marker: serde_json::Value) -> Self {
        Self {
            connection_id: ulid::Ulid::new().to_string(),
            write_marker,
        }
    }
}

/// Commit produced by a transfer for one blobber.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardCommit {
    pub blobber_id: String,
    pub payload: CommitPayload,
}

/// Per-blobber calls the engine depends on.
#[async_trait]
pub trait BlobberClient: Send + Sync {
    async fn list_dir(&self, blobber: &BlobberRef, path: &str) -> Result<ListResult>;

    /// `Ok(None)` when the blobber does not hold the file.
    async fn file_meta(&self, blobber: &BlobberRef, path: &str) -> Result<Option<FileMeta>>;

    /// Returns the raw response body on success.
    async fn commit(&self, blobber: &BlobberRef, payload: &CommitPayload) -> Result<String>;

    async fn add_collaborator(
        &self,
        blobber: &BlobberRef,
        path: &str,
        collaborator_id: &str,
    ) -> Result<()>;

    async fn remove_collaborator(
        &self,
        blobber: &BlobberRef,
        path: &str,
        collaborator_id: &str,
    ) -> Result<()>;
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}
