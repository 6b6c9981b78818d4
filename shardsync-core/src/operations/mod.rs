pub mod collaborator;
pub mod diff;
pub mod repair;
pub mod snapshot;

pub use collaborator::{
    BlobberOutcome, CollaboratorAction, CollaboratorOperation, CollaboratorOperationRequest,
};
pub use diff::{
    DiffOp, FileDiff, GetAllocationDiffOperation, GetAllocationDiffOperationRequest, categorize,
};
pub use repair::{RepairCompletedCallback, RepairHandle, RepairRequest, RepairState};
pub use snapshot::{SaveRemoteSnapshotOperation, SaveRemoteSnapshotOperationRequest};
