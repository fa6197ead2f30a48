//! Structural comparison of documents.
//!
//! The comparator matches nodes across versions by identifier (embedded value
//! objects by `(parent, role)`) and reports typed [`Difference`]s. With a
//! common ancestor it becomes a three-way comparison that attributes every
//! difference to a [`Side`] and groups incompatible ones into [`Conflict`]s.

pub mod apply;
pub mod comparator;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::document_io::DocumentIo;
use crate::errors::RepositoryError;
use crate::model::{Attributes, Embedded, NodeId, NodeKey, Value};
use crate::store::RevisionStore;

pub use apply::{apply, ApplyReport};
pub use comparator::StructuralComparator;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which version a difference originates from.
///
/// In a two-way comparison every difference is `Right`: it is a change the
/// right document makes relative to the left one. In a three-way comparison
/// `Left` is ours, `Right` is theirs, and `Both` means both sides made the
/// identical change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
    Both,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// The change a [`Difference`] describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DifferenceKind {
    /// The node (or embedded object) exists only on the originating side.
    ///
    /// Added nodes carry their own content but no children: descendants are
    /// reported by their own differences.
    ContainmentAdd {
        parent: NodeId,
        /// Previous sibling on the originating side, `None` for first.
        anchor: Option<NodeId>,
        kind: String,
        attributes: Attributes,
        embedded: BTreeMap<String, Embedded>,
    },
    /// The node (or embedded object) was removed from `parent`.
    ContainmentDelete { parent: NodeId },
    /// The node changed parent, or changed position inside the same parent
    /// when `from == to`.
    ContainmentMove {
        from: NodeId,
        to: NodeId,
        anchor: Option<NodeId>,
    },
    /// A named attribute changed. `value: None` means it was removed.
    AttributeChange {
        attribute: String,
        value: Option<Value>,
        previous: Option<Value>,
    },
}

impl DifferenceKind {
    pub fn is_containment(&self) -> bool {
        !matches!(self, Self::AttributeChange { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ContainmentAdd { .. } => "add",
            Self::ContainmentDelete { .. } => "delete",
            Self::ContainmentMove { .. } => "move",
            Self::AttributeChange { .. } => "change",
        }
    }

    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::ContainmentDelete { .. } => 0,
            Self::ContainmentAdd { .. } => 1,
            Self::ContainmentMove { .. } => 2,
            Self::AttributeChange { .. } => 3,
        }
    }

    /// Attribute name for attribute changes.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Self::AttributeChange { attribute, .. } => Some(attribute),
            _ => None,
        }
    }
}

/// A typed unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    pub key: NodeKey,
    pub kind: DifferenceKind,
    pub source: Side,
    pub conflict: bool,
}

impl Difference {
    pub(crate) fn new(key: NodeKey, kind: DifferenceKind, source: Side) -> Self {
        Self {
            key,
            kind,
            source,
            conflict: false,
        }
    }

    /// The slot two differences must share to compete: the node plus the
    /// attribute name for attribute changes.
    pub(crate) fn slot(&self) -> (&NodeKey, Option<&str>) {
        (&self.key, self.kind.attribute())
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.conflict { "!" } else { " " };
        match &self.kind {
            DifferenceKind::ContainmentAdd { parent, kind, .. } => {
                write!(f, "{}[{}] add {} {} under {}", marker, self.source, kind, self.key, parent)
            }
            DifferenceKind::ContainmentDelete { parent } => {
                write!(f, "{}[{}] delete {} from {}", marker, self.source, self.key, parent)
            }
            DifferenceKind::ContainmentMove { from, to, .. } if from == to => {
                write!(f, "{}[{}] reorder {} in {}", marker, self.source, self.key, to)
            }
            DifferenceKind::ContainmentMove { from, to, .. } => {
                write!(f, "{}[{}] move {} from {} to {}", marker, self.source, self.key, from, to)
            }
            DifferenceKind::AttributeChange {
                attribute,
                value,
                previous,
            } => {
                let show = |v: &Option<Value>| match v {
                    Some(v) => v.to_string(),
                    None => "<unset>".to_string(),
                };
                write!(
                    f,
                    "{}[{}] {}.{}: {} -> {}",
                    marker,
                    self.source,
                    self.key,
                    attribute,
                    show(previous),
                    show(value)
                )
            }
        }
    }
}

/// Categorisation of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides set the same attribute to different values.
    Attribute,
    /// One side deleted what the other side modified.
    DeleteModify,
    /// Both sides moved the same node to different places.
    MoveMove,
    /// Both sides added the same identifier with different content.
    AddAdd,
}

impl ConflictKind {
    pub fn category(self) -> ConflictCategory {
        match self {
            Self::Attribute => ConflictCategory::Attribute,
            _ => ConflictCategory::Containment,
        }
    }

    /// Precedence when two overlapping groups are merged.
    fn precedence(self) -> u8 {
        match self {
            Self::DeleteModify => 3,
            Self::MoveMove => 2,
            Self::AddAdd => 1,
            Self::Attribute => 0,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute => write!(f, "attribute"),
            Self::DeleteModify => write!(f, "delete_modify"),
            Self::MoveMove => write!(f, "move_move"),
            Self::AddAdd => write!(f, "add_add"),
        }
    }
}

/// Which policy knob governs a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictCategory {
    Attribute,
    Containment,
}

/// A group of mutually incompatible differences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// Indices into [`Comparison::differences`], ascending.
    pub differences: Vec<usize>,
}

impl Conflict {
    pub fn category(&self) -> ConflictCategory {
        self.kind.category()
    }

    /// Fold `other` into this group.
    pub(crate) fn absorb(&mut self, other: Conflict) {
        if other.kind.precedence() > self.kind.precedence() {
            self.kind = other.kind;
        }
        self.differences.extend(other.differences);
        self.differences.sort_unstable();
        self.differences.dedup();
    }
}

/// Result of a comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub differences: Vec<Difference>,
    pub conflicts: Vec<Conflict>,
}

impl Comparison {
    pub fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Differences not involved in any conflict.
    pub fn non_conflicting(&self) -> impl Iterator<Item = &Difference> {
        self.differences.iter().filter(|d| !d.conflict)
    }

    /// Differences of one conflict.
    pub fn members<'a>(&'a self, conflict: &'a Conflict) -> impl Iterator<Item = &'a Difference> {
        conflict
            .differences
            .iter()
            .filter_map(move |&i| self.differences.get(i))
    }

    pub fn count_from(&self, side: Side) -> usize {
        self.differences.iter().filter(|d| d.source == side).count()
    }
}

/// Read-only comparison of the document at two (or three) revisions.
///
/// Takes no repository lock: snapshots are immutable once extracted.
pub fn compare_revisions(
    store: &RevisionStore,
    io: &dyn DocumentIo,
    left: &str,
    right: &str,
    base: Option<&str>,
) -> Result<Comparison, RepositoryError> {
    let left = store.extract_snapshot(left, io)?;
    let right = store.extract_snapshot(right, io)?;
    let base = base.map(|b| store.extract_snapshot(b, io)).transpose()?;
    Ok(StructuralComparator::compare(
        left.document(),
        right.document(),
        base.as_ref().map(|b| b.document()),
    ))
}
