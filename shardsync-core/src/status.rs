//! Progress reporting for long-running allocation operations.

use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Upload,
    Download,
    Repair,
    Commit,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Repair => "repair",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// Capability every long-running operation reports through.
///
/// All methods default to no-ops so callers only override what they
/// display. Implementations must be cheap: they are invoked from the
/// dispatcher task and from the repair walk.
pub trait StatusCallback: Send + Sync {
    fn started(&self, _allocation_id: &str, _path: &str, _op: OpKind, _total_bytes: u64) {}

    fn in_progress(&self, _allocation_id: &str, _path: &str, _op: OpKind, _completed_bytes: u64) {}

    fn completed(&self, _allocation_id: &str, _path: &str, _op: OpKind, _size: u64) {}

    fn error(&self, _allocation_id: &str, _path: &str, _op: OpKind, _error: &SyncError) {}

    fn commit_meta_completed(&self, _request: &str, _response: &str, _error: Option<&str>) {}

    fn repair_completed(&self, _files_repaired: usize) {}

    fn repair_cancelled(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusCallback;

impl StatusCallback for NoopStatusCallback {}
