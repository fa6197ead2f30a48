//! Conflict-resolution policy and the wholesale fallback.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::compare::{ConflictCategory, Side};
use crate::integrity::Violation;

/// One of the two merged versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    Ours,
    Theirs,
}

impl Preference {
    /// The comparator side holding this version's changes.
    pub fn side(self) -> Side {
        match self {
            Self::Ours => Side::Left,
            Self::Theirs => Side::Right,
        }
    }
}

impl fmt::Display for Preference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ours => write!(f, "ours"),
            Self::Theirs => write!(f, "theirs"),
        }
    }
}

impl FromStr for Preference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            other => Err(format!("expected 'ours' or 'theirs', got '{}'", other)),
        }
    }
}

/// Which side wins each category of structural conflict.
///
/// Default: attribute conflicts keep ours, containment conflicts take theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    pub attribute: Preference,
    pub containment: Preference,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            attribute: Preference::Ours,
            containment: Preference::Theirs,
        }
    }
}

impl ConflictPolicy {
    pub fn winner(&self, category: ConflictCategory) -> Preference {
        match category {
            ConflictCategory::Attribute => self.attribute,
            ConflictCategory::Containment => self.containment,
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback
// ---------------------------------------------------------------------------

/// The three ways out of a merge that cannot be committed as computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackChoice {
    TakeOurs,
    TakeTheirs,
    Cancel,
}

impl fmt::Display for FallbackChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeOurs => write!(f, "take ours"),
            Self::TakeTheirs => write!(f, "take theirs"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Why the merge ended up in the fallback.
#[derive(Debug, Clone, Default)]
pub struct FallbackReport {
    /// Branch being merged.
    pub branch: String,
    /// Integrity problems of the structurally merged document.
    pub violations: Vec<Violation>,
    /// Non-document paths git could not merge.
    pub conflicted_paths: Vec<String>,
}

/// Decides the fallback outcome. The CLI prompts; tests and unattended runs
/// use [`FixedFallback`].
pub trait FallbackResolver: Send + Sync {
    fn choose(&self, report: &FallbackReport) -> FallbackChoice;
}

/// Always returns the same choice.
#[derive(Debug, Clone, Copy)]
pub struct FixedFallback(pub FallbackChoice);

impl Default for FixedFallback {
    fn default() -> Self {
        Self(FallbackChoice::Cancel)
    }
}

impl FallbackResolver for FixedFallback {
    fn choose(&self, _report: &FallbackReport) -> FallbackChoice {
        self.0
    }
}

impl<F> FallbackResolver for F
where
    F: Fn(&FallbackReport) -> FallbackChoice + Send + Sync,
{
    fn choose(&self, report: &FallbackReport) -> FallbackChoice {
        self(report)
    }
}
