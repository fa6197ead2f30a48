//! Branch merging: the orchestration state machine and its policies.

pub mod engine;
pub mod policy;

pub use engine::{MergeEngine, MergeOutcome, MergeReport, MergeState};
pub use policy::{
    ConflictPolicy, FallbackChoice, FallbackReport, FallbackResolver, FixedFallback, Preference,
};
