//! Applying differences to a document.
//!
//! Application happens in phases so that order inside the difference list
//! does not matter: added nodes are staged and moved nodes detached, deletes
//! cascade, staged nodes are then attached once their parent exists and
//! their anchor is in place, and attribute edits run last.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use super::{Difference, DifferenceKind};
use crate::model::{Document, Embedded, Node, NodeId, NodeKey};

/// Counts reported by [`apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
}

impl ApplyReport {
    fn skip(&mut self, difference: &Difference, reason: &str) {
        warn!(difference = %difference, reason, "difference skipped");
        self.skipped += 1;
    }
}

/// A node waiting to be attached.
struct Pending<'d> {
    difference: &'d Difference,
    id: NodeId,
    parent: &'d NodeId,
    anchor: Option<&'d NodeId>,
    /// Original parent and previous sibling of a moved node.
    restore: Option<(NodeId, Option<NodeId>)>,
}

/// Apply `differences` to `document`.
///
/// Differences whose target is absent, whose identifier is already taken, or
/// that would make a node contain itself are skipped and counted; the
/// document stays a well-formed tree either way.
pub fn apply<'d, I>(document: &mut Document, differences: I) -> ApplyReport
where
    I: IntoIterator<Item = &'d Difference>,
{
    let differences: Vec<&Difference> = differences.into_iter().collect();
    let mut report = ApplyReport::default();
    // Containment before any edit. Staging only detaches moved nodes, which
    // leaves every other child-to-parent pair intact.
    let parents = document.parent_index();

    // Stage adds, detach moves.
    let mut pending: Vec<Pending<'_>> = Vec::new();
    for &d in &differences {
        match (&d.key, &d.kind) {
            (
                NodeKey::Node(id),
                DifferenceKind::ContainmentAdd {
                    parent,
                    anchor,
                    kind,
                    attributes,
                    embedded,
                },
            ) => {
                if document.contains(id) {
                    report.skip(d, "identifier already present");
                    continue;
                }
                let mut node = Node::new(id.clone(), kind.clone());
                node.attributes = attributes.clone();
                node.embedded = embedded.clone();
                document.insert_detached(node);
                pending.push(Pending {
                    difference: d,
                    id: id.clone(),
                    parent,
                    anchor: anchor.as_ref(),
                    restore: None,
                });
            }
            (NodeKey::Node(id), DifferenceKind::ContainmentMove { to, anchor, .. }) => {
                let Some(from) = parents.get(id).cloned() else {
                    report.skip(d, "node to move is absent");
                    continue;
                };
                let previous = document.node(&from).and_then(|p| {
                    let i = p.children.iter().position(|c| c == id)?;
                    i.checked_sub(1).map(|i| p.children[i].clone())
                });
                document.detach_from(&from, id);
                pending.push(Pending {
                    difference: d,
                    id: id.clone(),
                    parent: to,
                    anchor: anchor.as_ref(),
                    restore: Some((from, previous)),
                });
            }
            _ => {}
        }
    }

    // Deletes cascade to the subtree.
    let mut removed: BTreeSet<NodeId> = BTreeSet::new();
    for &d in &differences {
        if !matches!(d.kind, DifferenceKind::ContainmentDelete { .. }) {
            continue;
        }
        match &d.key {
            NodeKey::Node(id) => {
                if id == document.root() {
                    report.skip(d, "the root cannot be deleted");
                } else if document.contains(id) {
                    if let Some(parent) = parents.get(id) {
                        document.detach_from(parent, id);
                    }
                    removed.extend(document.drop_subtree(id));
                    report.applied += 1;
                } else if removed.contains(id) {
                    report.applied += 1;
                } else {
                    report.skip(d, "node to delete is absent");
                }
            }
            NodeKey::Embedded { parent, role } => {
                let gone = document
                    .node_mut(parent)
                    .and_then(|n| n.embedded.remove(role))
                    .is_some();
                if gone || removed.contains(parent) {
                    report.applied += 1;
                } else {
                    report.skip(d, "embedded object to delete is absent");
                }
            }
        }
    }
    pending.retain(|p| {
        let alive = document.contains(&p.id);
        if !alive {
            report.skip(p.difference, "node deleted in the same batch");
        }
        alive
    });

    // Attach in dependency order: parent present, anchor already placed.
    let mut unplaced: HashSet<NodeId> = pending.iter().map(|p| p.id.clone()).collect();
    loop {
        let waiting_before = pending.len();
        let mut waiting = Vec::with_capacity(waiting_before);
        for p in pending {
            let ready =
                document.contains(p.parent) && p.anchor.map_or(true, |a| !unplaced.contains(a));
            if ready {
                unplaced.remove(&p.id);
                place(document, p, &mut report);
            } else {
                waiting.push(p);
            }
        }
        pending = waiting;
        if pending.is_empty() || pending.len() == waiting_before {
            break;
        }
    }
    // Whatever is left waits on a missing parent or on an anchor that will
    // never be placed; attach what still can be.
    for p in pending {
        place(document, p, &mut report);
    }

    // Embedded objects, then attribute values.
    for &d in &differences {
        if let (
            NodeKey::Embedded { parent, role },
            DifferenceKind::ContainmentAdd {
                kind, attributes, ..
            },
        ) = (&d.key, &d.kind)
        {
            match document.node_mut(parent) {
                Some(owner) => {
                    owner.embedded.insert(
                        role.clone(),
                        Embedded {
                            kind: kind.clone(),
                            attributes: attributes.clone(),
                        },
                    );
                    report.applied += 1;
                }
                None => report.skip(d, "owner of embedded object is absent"),
            }
        }
    }
    for &d in &differences {
        let DifferenceKind::AttributeChange {
            attribute, value, ..
        } = &d.kind
        else {
            continue;
        };
        let target = match &d.key {
            NodeKey::Node(id) => document.node_mut(id).map(|n| &mut n.attributes),
            NodeKey::Embedded { parent, role } => document
                .node_mut(parent)
                .and_then(|n| n.embedded.get_mut(role))
                .map(|e| &mut e.attributes),
        };
        match target {
            Some(attributes) => {
                match value {
                    Some(v) => attributes.insert(attribute.clone(), v.clone()),
                    None => attributes.remove(attribute),
                };
                report.applied += 1;
            }
            None => report.skip(d, "attribute owner is absent"),
        }
    }

    debug!(
        applied = report.applied,
        skipped = report.skipped,
        "differences applied"
    );
    report
}

/// Attach a pending node, or undo its staging when that is impossible.
fn place(document: &mut Document, pending: Pending<'_>, report: &mut ApplyReport) {
    let Pending {
        difference,
        id,
        parent,
        anchor,
        restore,
    } = pending;

    let reason = if !document.contains(parent) {
        Some("destination parent is absent")
    } else if restore.is_some() && document.is_in_subtree(parent, &id) {
        Some("move would create a containment cycle")
    } else {
        None
    };

    match (reason, restore) {
        (None, _) => {
            document.attach_after(parent, id, anchor);
            report.applied += 1;
        }
        (Some(reason), Some((from, previous))) if document.contains(&from) => {
            document.attach_after(&from, id, previous.as_ref());
            report.skip(difference, reason);
        }
        (Some(reason), _) => {
            document.drop_subtree(&id);
            report.skip(difference, reason);
        }
    }
}
