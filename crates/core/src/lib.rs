//! modelmerge core library.
//!
//! Structural merging of a hierarchical model document versioned in a git
//! repository: the revision store, document persistence, the structural
//! comparator, integrity checks, and the merge engine that ties them together.

pub mod compare;
pub mod config;
pub mod document_io;
pub mod errors;
pub mod integrity;
pub mod merge;
pub mod model;
pub mod store;

// Re-exports for convenience.
pub use compare::{Comparison, Difference, DifferenceKind, StructuralComparator};
pub use config::ModelMergeConfig;
pub use document_io::{DocumentIo, JsonDocumentIo};
pub use integrity::{IntegrityChecker, IntegrityReport, Violation};
pub use merge::{MergeEngine, MergeOutcome};
pub use model::{Document, Snapshot};
pub use store::{BranchStatus, RevisionStore};
