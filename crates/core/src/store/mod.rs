//! Revision store: the version-control primitives the merge engine needs.

pub mod branch_status;
pub mod lock;
pub mod revision_store;

pub use branch_status::{BranchInfo, BranchKind, BranchStatus, TrackingStatus};
pub use lock::RepositoryLock;
pub use revision_store::{CommitHandle, Credentials, MergeStatus, MergeStrategy, RevisionStore};
