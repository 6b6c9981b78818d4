//! Shardsync Core - keeps a local directory tree in sync with an
//! erasure-coded allocation spread across independent blobbers.
//!
//! - threshold consensus over per-blobber listings
//! - three-way diff against a persisted snapshot
//! - cancellable repair of under-replicated files
//! - per-blobber ordered metadata commits

pub mod allocation;
pub mod blobber;
pub mod commit;
pub mod config;
pub mod consensus;
pub mod dispatcher;
pub mod error;
pub mod local;
pub mod operations;
pub mod paths;
pub mod snapshot;
pub mod status;
pub mod transfer;

pub use allocation::{Allocation, AllocationBuilder, TransferProgress};
pub use blobber::{
    BlobberClient, BlobberRef, CommitPayload, EntryKind, FileMeta, HttpBlobberClient, ListResult,
    ShardCommit,
};
pub use commit::{CommitCoordinator, CommitRequest, CommitResult};
pub use config::{AllocationConfig, CollaboratorConfig, CollaboratorPolicy, DispatcherConfig};
pub use consensus::{ConsensusReader, DirConsensus, RemoteFile, RemoteTree, RepairCheck};
pub use dispatcher::{
    DispatchHandler, DownloadRequest, RepairFileRequest, RequestDispatcher, RequestSenders,
    TransferHandler, UploadRequest,
};
pub use error::{Result, SyncError};
pub use local::{LocalFile, compute_hash, hash_file, scan_local_tree};
pub use operations::{
    BlobberOutcome, CollaboratorAction, CollaboratorOperation, CollaboratorOperationRequest,
    DiffOp, FileDiff, GetAllocationDiffOperation, GetAllocationDiffOperationRequest, RepairHandle,
    RepairRequest, RepairState, SaveRemoteSnapshotOperation, SaveRemoteSnapshotOperationRequest,
};
pub use snapshot::{SnapshotCache, SnapshotEntry};
pub use status::{NoopStatusCallback, OpKind, StatusCallback};
pub use transfer::FileTransfer;
