//! Identity-based two- and three-way comparison.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use super::{Comparison, Conflict, ConflictKind, Difference, DifferenceKind, Side};
use crate::model::{Attributes, Document, Node, NodeId, NodeKey};

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Lookups over one document, built once per comparison.
struct DocIndex<'a> {
    doc: &'a Document,
    parents: std::collections::BTreeMap<NodeId, NodeId>,
    position: HashMap<NodeId, usize>,
    /// Index of each child inside its parent's child list.
    sibling: HashMap<NodeId, usize>,
}

impl<'a> DocIndex<'a> {
    fn new(doc: &'a Document) -> Self {
        let position = doc
            .pre_order()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        let sibling = doc
            .nodes()
            .flat_map(|n| n.children.iter().enumerate())
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            doc,
            parents: doc.parent_index(),
            position,
            sibling,
        }
    }

    fn parent(&self, id: &NodeId) -> Option<&NodeId> {
        self.parents.get(id)
    }

    /// Previous sibling of `id` inside its parent.
    fn anchor(&self, id: &NodeId) -> Option<NodeId> {
        let parent = self.parents.get(id)?;
        let children = &self.doc.node(parent)?.children;
        let i = *self.sibling.get(id)?;
        i.checked_sub(1).and_then(|i| children.get(i)).cloned()
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.position.get(id).copied()
    }
}

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

/// Stateless structural comparator.
pub struct StructuralComparator;

impl StructuralComparator {
    /// Compare `left` against `right`, optionally relative to a common
    /// `ancestor`.
    ///
    /// Without an ancestor, the differences describe what turns `left` into
    /// `right`: applying them to `left` reproduces `right`. With an ancestor,
    /// `left` is ours and `right` is theirs; each difference is attributed to
    /// the side(s) that made it and incompatible ones are grouped into
    /// conflicts. Inputs are never mutated and the output order is a pure
    /// function of the inputs.
    pub fn compare(left: &Document, right: &Document, ancestor: Option<&Document>) -> Comparison {
        match ancestor {
            None => Self::two_way(left, right),
            Some(base) => Self::three_way(left, right, base),
        }
    }

    /// Two-way comparison: every difference originates from `right`.
    pub fn two_way(left: &Document, right: &Document) -> Comparison {
        let l = DocIndex::new(left);
        let r = DocIndex::new(right);
        let mut differences = diff_sides(&r, &l, Side::Right);
        sort_differences(&mut differences, &l, &r, None);
        debug!(differences = differences.len(), "two-way comparison complete");
        Comparison {
            differences,
            conflicts: Vec::new(),
        }
    }

    /// Three-way comparison of ours and theirs against their merge base.
    pub fn three_way(ours: &Document, theirs: &Document, base: &Document) -> Comparison {
        let o = DocIndex::new(ours);
        let t = DocIndex::new(theirs);
        let b = DocIndex::new(base);

        let left = diff_sides(&o, &b, Side::Left);
        let right = diff_sides(&t, &b, Side::Right);
        let (left_count, right_count) = (left.len(), right.len());

        let mut differences = combine(left, right, &o, &t);
        sort_differences(&mut differences, &b, &o, Some(&t));
        let conflicts = detect_conflicts(&differences);
        for conflict in &conflicts {
            for &i in &conflict.differences {
                differences[i].conflict = true;
            }
        }

        info!(
            ours = left_count,
            theirs = right_count,
            differences = differences.len(),
            conflicts = conflicts.len(),
            "three-way comparison complete"
        );
        Comparison {
            differences,
            conflicts,
        }
    }
}

// ---------------------------------------------------------------------------
// Two-way pass
// ---------------------------------------------------------------------------

/// Differences that turn `reference` into `source`, attributed to `side`.
fn diff_sides(source: &DocIndex<'_>, reference: &DocIndex<'_>, side: Side) -> Vec<Difference> {
    let mut out = Vec::new();

    for node in source.doc.nodes() {
        let key = NodeKey::Node(node.id.clone());
        match reference.doc.node(&node.id) {
            None => {
                // The root and unreachable nodes have no parent to add under.
                let Some(parent) = source.parent(&node.id) else {
                    continue;
                };
                out.push(Difference::new(
                    key,
                    DifferenceKind::ContainmentAdd {
                        parent: parent.clone(),
                        anchor: source.anchor(&node.id),
                        kind: node.kind.clone(),
                        attributes: node.attributes.clone(),
                        embedded: node.embedded.clone(),
                    },
                    side,
                ));
            }
            Some(old) => {
                attribute_diffs(&key, &node.attributes, &old.attributes, side, &mut out);
                embedded_diffs(node, old, side, &mut out);
                if let (Some(to), Some(from)) =
                    (source.parent(&node.id), reference.parent(&node.id))
                {
                    if to != from {
                        out.push(Difference::new(
                            key,
                            DifferenceKind::ContainmentMove {
                                from: from.clone(),
                                to: to.clone(),
                                anchor: source.anchor(&node.id),
                            },
                            side,
                        ));
                    }
                }
                reorder_diffs(node, old, source, reference, side, &mut out);
            }
        }
    }

    for node in reference.doc.nodes() {
        if source.doc.contains(&node.id) {
            continue;
        }
        if let Some(parent) = reference.parent(&node.id) {
            out.push(Difference::new(
                NodeKey::Node(node.id.clone()),
                DifferenceKind::ContainmentDelete {
                    parent: parent.clone(),
                },
                side,
            ));
        }
    }

    out
}

fn attribute_diffs(
    key: &NodeKey,
    new: &Attributes,
    old: &Attributes,
    side: Side,
    out: &mut Vec<Difference>,
) {
    let names: BTreeSet<&String> = new.keys().chain(old.keys()).collect();
    for name in names {
        let (value, previous) = (new.get(name), old.get(name));
        if value != previous {
            out.push(Difference::new(
                key.clone(),
                DifferenceKind::AttributeChange {
                    attribute: name.clone(),
                    value: value.cloned(),
                    previous: previous.cloned(),
                },
                side,
            ));
        }
    }
}

/// Embedded objects match by `(owner, role)`.
fn embedded_diffs(node: &Node, old: &Node, side: Side, out: &mut Vec<Difference>) {
    let key = |role: &str| NodeKey::Embedded {
        parent: node.id.clone(),
        role: role.to_string(),
    };
    for (role, emb) in &node.embedded {
        match old.embedded.get(role) {
            Some(prev) if prev.kind == emb.kind => {
                attribute_diffs(&key(role), &emb.attributes, &prev.attributes, side, out);
            }
            // New role, or the value object was replaced by one of another kind.
            _ => out.push(Difference::new(
                key(role),
                DifferenceKind::ContainmentAdd {
                    parent: node.id.clone(),
                    anchor: None,
                    kind: emb.kind.clone(),
                    attributes: emb.attributes.clone(),
                    embedded: Default::default(),
                },
                side,
            )),
        }
    }
    for role in old.embedded.keys() {
        if !node.embedded.contains_key(role) {
            out.push(Difference::new(
                key(role),
                DifferenceKind::ContainmentDelete {
                    parent: node.id.clone(),
                },
                side,
            ));
        }
    }
}

/// Position changes among children that stayed under the same parent.
///
/// Children on a longest common subsequence of both orders keep their place;
/// every other child is reported as a move within the parent.
fn reorder_diffs(
    node: &Node,
    old: &Node,
    source: &DocIndex<'_>,
    reference: &DocIndex<'_>,
    side: Side,
    out: &mut Vec<Difference>,
) {
    let stayed = |id: &&NodeId, idx: &DocIndex<'_>| idx.parent(id) == Some(&node.id);
    let now: Vec<&NodeId> = node
        .children
        .iter()
        .filter(|c| stayed(c, reference))
        .collect();
    let before: Vec<&NodeId> = old.children.iter().filter(|c| stayed(c, source)).collect();
    if now == before {
        return;
    }
    let keep = lcs(&now, &before);
    for child in now {
        if !keep.contains(child) {
            out.push(Difference::new(
                NodeKey::Node(child.clone()),
                DifferenceKind::ContainmentMove {
                    from: node.id.clone(),
                    to: node.id.clone(),
                    anchor: source.anchor(child),
                },
                side,
            ));
        }
    }
}

fn lcs<'a>(a: &[&'a NodeId], b: &[&'a NodeId]) -> BTreeSet<&'a NodeId> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut keep = BTreeSet::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            keep.insert(a[i]);
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    keep
}

// ---------------------------------------------------------------------------
// Three-way combination
// ---------------------------------------------------------------------------

/// Merge both sides' differences, collapsing identical changes to `Both`.
fn combine(
    left: Vec<Difference>,
    right: Vec<Difference>,
    ours: &DocIndex<'_>,
    theirs: &DocIndex<'_>,
) -> Vec<Difference> {
    let mut right_slots: HashMap<(NodeKey, Option<String>), usize> = HashMap::new();
    for (i, d) in right.iter().enumerate() {
        let (key, attr) = d.slot();
        right_slots.insert((key.clone(), attr.map(str::to_string)), i);
    }

    let mut collapsed = vec![false; right.len()];
    let mut out = Vec::with_capacity(left.len() + right.len());
    for mut l in left {
        let (key, attr) = l.slot();
        let slot = (key.clone(), attr.map(str::to_string));
        if let Some(&ri) = right_slots.get(&slot) {
            if same_change(&l.kind, &right[ri].kind) && same_place(&l, &right[ri], ours, theirs) {
                collapsed[ri] = true;
                l.source = Side::Both;
            }
        }
        out.push(l);
    }
    out.extend(
        right
            .into_iter()
            .zip(collapsed)
            .filter(|(_, c)| !c)
            .map(|(d, _)| d),
    );
    out
}

/// Whether two same-slot changes lead to the same state. Positions are
/// checked separately by [`same_place`].
fn same_change(a: &DifferenceKind, b: &DifferenceKind) -> bool {
    use DifferenceKind::*;
    match (a, b) {
        (
            ContainmentAdd {
                parent: p1,
                kind: k1,
                attributes: a1,
                embedded: e1,
                ..
            },
            ContainmentAdd {
                parent: p2,
                kind: k2,
                attributes: a2,
                embedded: e2,
                ..
            },
        ) => p1 == p2 && k1 == k2 && a1 == a2 && e1 == e2,
        (ContainmentDelete { .. }, ContainmentDelete { .. }) => true,
        (ContainmentMove { to: t1, .. }, ContainmentMove { to: t2, .. }) => t1 == t2,
        (AttributeChange { value: v1, .. }, AttributeChange { value: v2, .. }) => v1 == v2,
        _ => false,
    }
}

/// Whether a node both sides added or moved under the same parent ends up
/// at the same position. Positions are compared relative to the siblings
/// that sit under that parent on both sides, so unrelated insertions on one
/// side do not count.
fn same_place(l: &Difference, r: &Difference, ours: &DocIndex<'_>, theirs: &DocIndex<'_>) -> bool {
    let NodeKey::Node(id) = &l.key else {
        return true;
    };
    let parent = match (&l.kind, &r.kind) {
        (DifferenceKind::ContainmentMove { to, .. }, DifferenceKind::ContainmentMove { .. }) => to,
        (DifferenceKind::ContainmentAdd { parent, .. }, DifferenceKind::ContainmentAdd { .. }) => {
            parent
        }
        _ => return true,
    };
    shared_anchor(ours, theirs, id, parent) == shared_anchor(theirs, ours, id, parent)
}

/// Nearest previous sibling of `id` under `parent` in `own` that `other`
/// also keeps under `parent`.
fn shared_anchor<'d>(
    own: &DocIndex<'d>,
    other: &DocIndex<'_>,
    id: &NodeId,
    parent: &NodeId,
) -> Option<&'d NodeId> {
    let children = &own.doc.node(parent)?.children;
    let i = *own.sibling.get(id)?;
    children[..i]
        .iter()
        .rev()
        .find(|c| other.parent(c) == Some(parent))
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Sort by pre-order position of the owning node in `reference`; nodes the
/// reference lacks follow, ordered by their position on their own side.
fn sort_differences(
    differences: &mut [Difference],
    reference: &DocIndex<'_>,
    left: &DocIndex<'_>,
    right: Option<&DocIndex<'_>>,
) {
    differences.sort_by_cached_key(|d| {
        let owner = d.key.owner();
        let (group, position) = match reference.position(owner) {
            Some(p) => (0u8, p),
            None => match (d.source, right) {
                (Side::Right, Some(r)) => (2, r.position(owner).unwrap_or(usize::MAX)),
                _ => (1, left.position(owner).unwrap_or(usize::MAX)),
            },
        };
        (
            group,
            position,
            d.key.clone(),
            d.kind.rank(),
            d.kind.attribute().map(str::to_string),
            d.source,
        )
    });
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Group conflicting differences. Overlapping candidate groups are united so
/// that every difference belongs to at most one conflict.
fn detect_conflicts(differences: &[Difference]) -> Vec<Conflict> {
    let mut candidates: Vec<(ConflictKind, Vec<usize>)> = Vec::new();

    // Same slot, different change.
    let mut slots: HashMap<(&NodeKey, Option<&str>), Vec<usize>> = HashMap::new();
    for (i, d) in differences.iter().enumerate() {
        slots.entry(d.slot()).or_default().push(i);
    }
    let mut same_slot: Vec<&Vec<usize>> = slots.values().filter(|v| v.len() > 1).collect();
    same_slot.sort();
    for members in same_slot {
        let kind = match (&differences[members[0]].kind, &differences[members[1]].kind) {
            (DifferenceKind::AttributeChange { .. }, _) => ConflictKind::Attribute,
            (DifferenceKind::ContainmentAdd { .. }, DifferenceKind::ContainmentAdd { .. }) => {
                ConflictKind::AddAdd
            }
            (DifferenceKind::ContainmentMove { .. }, DifferenceKind::ContainmentMove { .. }) => {
                ConflictKind::MoveMove
            }
            _ => ConflictKind::DeleteModify,
        };
        candidates.push((kind, members.clone()));
    }

    // One side deletes what the other side modifies.
    let mut by_owner: HashMap<&NodeId, Vec<usize>> = HashMap::new();
    let mut by_destination: HashMap<&NodeId, Vec<usize>> = HashMap::new();
    for (i, d) in differences.iter().enumerate() {
        by_owner.entry(d.key.owner()).or_default().push(i);
        match &d.kind {
            DifferenceKind::ContainmentAdd { parent, .. } if matches!(d.key, NodeKey::Node(_)) => {
                by_destination.entry(parent).or_default().push(i);
            }
            DifferenceKind::ContainmentMove { to, .. } => {
                by_destination.entry(to).or_default().push(i);
            }
            _ => {}
        }
    }
    for (i, d) in differences.iter().enumerate() {
        if !matches!(d.kind, DifferenceKind::ContainmentDelete { .. }) {
            continue;
        }
        let other = match d.source {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Both => continue,
        };
        let is_modification = |j: &usize| {
            let m = &differences[*j];
            m.source == other && !matches!(m.kind, DifferenceKind::ContainmentDelete { .. })
        };
        let mut members: BTreeSet<usize> = BTreeSet::new();
        match &d.key {
            NodeKey::Node(id) => {
                for j in by_owner.get(id).into_iter().flatten().filter(|j| is_modification(j)) {
                    // Same-slot moves are already paired above.
                    if differences[*j].slot() != d.slot() {
                        members.insert(*j);
                    }
                }
                members.extend(
                    by_destination
                        .get(id)
                        .into_iter()
                        .flatten()
                        .filter(|j| is_modification(j)),
                );
            }
            NodeKey::Embedded { .. } => {
                members.extend(
                    by_owner
                        .get(d.key.owner())
                        .into_iter()
                        .flatten()
                        .filter(|j| is_modification(j) && differences[**j].key == d.key),
                );
            }
        }
        if !members.is_empty() {
            members.insert(i);
            candidates.push((ConflictKind::DeleteModify, members.into_iter().collect()));
        }
    }

    // One side replaces an embedded object the other side edits in place.
    for (i, d) in differences.iter().enumerate() {
        if !matches!(
            (&d.key, &d.kind),
            (NodeKey::Embedded { .. }, DifferenceKind::ContainmentAdd { .. })
        ) {
            continue;
        }
        let other = match d.source {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Both => continue,
        };
        let mut members: Vec<usize> = by_owner
            .get(d.key.owner())
            .into_iter()
            .flatten()
            .copied()
            .filter(|&j| {
                let m = &differences[j];
                m.source == other && m.key == d.key && m.slot() != d.slot()
            })
            .collect();
        if !members.is_empty() {
            members.push(i);
            members.sort_unstable();
            candidates.push((ConflictKind::DeleteModify, members));
        }
    }

    unite(differences.len(), candidates)
}

/// Union overlapping candidate groups.
fn unite(len: usize, candidates: Vec<(ConflictKind, Vec<usize>)>) -> Vec<Conflict> {
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut parent: Vec<usize> = (0..len).collect();
    for (_, members) in &candidates {
        let first = find(&mut parent, members[0]);
        for &m in &members[1..] {
            let root = find(&mut parent, m);
            if root != first {
                parent[root] = first;
            }
        }
    }

    let mut groups: HashMap<usize, Conflict> = HashMap::new();
    for (kind, members) in candidates {
        let root = find(&mut parent, members[0]);
        let entry = groups.entry(root).or_insert_with(|| Conflict {
            kind,
            differences: Vec::new(),
        });
        entry.absorb(Conflict {
            kind,
            differences: members,
        });
    }

    let mut conflicts: Vec<Conflict> = groups.into_values().collect();
    conflicts.sort_by_key(|c| c.differences.first().copied());
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ConflictCategory;
    use crate::model::fixtures::sample;
    use crate::model::{Embedded, Value};

    fn set(doc: &mut Document, id: &str, name: &str, value: Value) {
        doc.node_mut(&id.into())
            .unwrap()
            .attributes
            .insert(name.into(), value);
    }

    #[test]
    fn test_identical_documents_have_no_differences() {
        let doc = sample();
        assert!(StructuralComparator::compare(&doc, &doc.clone(), None).is_empty());
        assert!(StructuralComparator::compare(&doc, &doc, Some(&doc)).is_empty());
    }

    #[test]
    fn test_attribute_change_and_removal() {
        let before = sample();
        let mut after = sample();
        set(&mut after, "a", "name", Value::text("A2"));
        after.node_mut(&"v1".into()).unwrap().attributes.remove("target");

        let cmp = StructuralComparator::two_way(&before, &after);
        assert_eq!(cmp.differences.len(), 2);
        assert_eq!(
            cmp.differences[0].kind,
            DifferenceKind::AttributeChange {
                attribute: "name".into(),
                value: Some(Value::text("A2")),
                previous: Some(Value::text("A")),
            }
        );
        assert!(matches!(
            &cmp.differences[1].kind,
            DifferenceKind::AttributeChange { value: None, .. }
        ));
    }

    #[test]
    fn test_reference_compared_by_identity() {
        let before = sample();
        let mut after = sample();
        // Same target, different content at the target: no difference on v1.
        set(&mut after, "a", "name", Value::text("renamed"));
        let cmp = StructuralComparator::two_way(&before, &after);
        assert!(cmp
            .differences
            .iter()
            .all(|d| d.key == NodeKey::Node("a".into())));

        set(&mut after, "v1", "target", Value::Ref("b".into()));
        let cmp = StructuralComparator::two_way(&before, &after);
        assert!(cmp
            .differences
            .iter()
            .any(|d| d.key == NodeKey::Node("v1".into())));
    }

    #[test]
    fn test_add_carries_anchor_and_delete_reports_parent() {
        let before = sample();
        let mut after = sample();
        after.add_child(&"f1".into(), Node::new("c", "element"));
        after.remove_subtree(&"b".into());

        let cmp = StructuralComparator::two_way(&before, &after);
        let kinds: Vec<&DifferenceKind> = cmp.differences.iter().map(|d| &d.kind).collect();
        assert_eq!(cmp.differences.len(), 2);
        assert!(kinds.contains(&&DifferenceKind::ContainmentDelete {
            parent: "f1".into()
        }));
        assert!(kinds.iter().any(|k| matches!(
            k,
            DifferenceKind::ContainmentAdd { parent, anchor: Some(a), .. }
                if parent.as_str() == "f1" && a.as_str() == "a"
        )));
    }

    #[test]
    fn test_move_and_reorder() {
        let before = sample();
        let mut after = sample();
        // b moves to the root, after f1.
        after.detach(&"b".into());
        after.attach_after(&"model".into(), "b".into(), Some(&"f1".into()));
        let cmp = StructuralComparator::two_way(&before, &after);
        assert_eq!(cmp.differences.len(), 1);
        assert_eq!(
            cmp.differences[0].kind,
            DifferenceKind::ContainmentMove {
                from: "f1".into(),
                to: "model".into(),
                anchor: Some("f1".into()),
            }
        );

        // v1 moves in front of f1 within the root: one reorder only.
        let mut after = sample();
        after.node_mut(&"model".into()).unwrap().children.reverse();
        let cmp = StructuralComparator::two_way(&before, &after);
        assert_eq!(cmp.differences.len(), 1);
        assert!(matches!(
            &cmp.differences[0].kind,
            DifferenceKind::ContainmentMove { from, to, .. } if from == to
        ));
    }

    #[test]
    fn test_embedded_matched_by_parent_and_role() {
        let before = sample();
        let mut after = sample();
        after.node_mut(&"v1".into())
            .unwrap()
            .embedded
            .insert(
                "bounds".into(),
                Embedded::new("bounds")
                    .with("x", Value::Int(15))
                    .with("y", Value::Int(20)),
            );
        let cmp = StructuralComparator::two_way(&before, &after);
        assert_eq!(cmp.differences.len(), 1);
        assert_eq!(
            cmp.differences[0].key,
            NodeKey::Embedded {
                parent: "v1".into(),
                role: "bounds".into()
            }
        );
        assert_eq!(cmp.differences[0].kind.attribute(), Some("x"));
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let before = sample();
        let mut after = sample();
        set(&mut after, "v1", "name", Value::text("V"));
        set(&mut after, "model", "name", Value::text("M2"));
        after.add_child(&"f1".into(), Node::new("c", "element"));
        after.remove_subtree(&"a".into());
        let first = StructuralComparator::two_way(&before, &after);
        let second = StructuralComparator::two_way(&before.clone(), &after.clone());
        assert_eq!(first, second);
        let owners: Vec<String> = first
            .differences
            .iter()
            .map(|d| d.key.owner().to_string())
            .collect();
        assert_eq!(owners, vec!["model", "a", "v1", "c"]);
    }

    #[test]
    fn test_three_way_disjoint_changes() {
        let base = sample();
        let mut ours = sample();
        let mut theirs = sample();
        set(&mut ours, "a", "name", Value::text("A-ours"));
        set(&mut theirs, "b", "name", Value::text("B-theirs"));
        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert_eq!(cmp.differences.len(), 2);
        assert!(!cmp.has_conflicts());
        assert_eq!(cmp.count_from(Side::Left), 1);
        assert_eq!(cmp.count_from(Side::Right), 1);
    }

    #[test]
    fn test_three_way_identical_change_collapses() {
        let base = sample();
        let mut ours = sample();
        set(&mut ours, "a", "name", Value::text("Same"));
        let theirs = ours.clone();
        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert_eq!(cmp.differences.len(), 1);
        assert_eq!(cmp.differences[0].source, Side::Both);
        assert!(!cmp.has_conflicts());
    }

    #[test]
    fn test_three_way_attribute_conflict() {
        let base = sample();
        let mut ours = sample();
        let mut theirs = sample();
        set(&mut ours, "a", "name", Value::text("C"));
        set(&mut theirs, "a", "name", Value::text("B"));
        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert_eq!(cmp.conflicts.len(), 1);
        let conflict = &cmp.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::Attribute);
        assert_eq!(conflict.category(), ConflictCategory::Attribute);
        let sides: Vec<Side> = cmp.members(conflict).map(|d| d.source).collect();
        assert_eq!(sides, vec![Side::Left, Side::Right]);
        assert!(cmp.differences.iter().all(|d| d.conflict));
    }

    #[test]
    fn test_three_way_delete_modify() {
        let base = sample();
        let mut ours = sample();
        let mut theirs = sample();
        ours.remove_subtree(&"f1".into());
        set(&mut theirs, "a", "name", Value::text("edited"));
        theirs.add_child(&"f1".into(), Node::new("c", "element"));

        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        // a's delete conflicts with its edit; f1's delete with the add into it.
        assert_eq!(cmp.conflicts.len(), 2);
        assert!(cmp
            .conflicts
            .iter()
            .all(|c| c.kind == ConflictKind::DeleteModify));
        // b was only deleted: applies cleanly.
        let b_delete = cmp
            .differences
            .iter()
            .find(|d| d.key == NodeKey::Node("b".into()))
            .unwrap();
        assert!(!b_delete.conflict);
    }

    fn with_third_element() -> Document {
        let mut doc = sample();
        doc.add_child(&"f1".into(), Node::new("c", "element"));
        doc
    }

    fn reorder(doc: &mut Document, parent: &str, order: &[&str]) {
        doc.node_mut(&parent.into()).unwrap().children =
            order.iter().map(|id| NodeId::from(*id)).collect();
    }

    #[test]
    fn test_three_way_reorders_to_different_positions_conflict() {
        let base = with_third_element();
        let mut ours = base.clone();
        let mut theirs = base.clone();
        reorder(&mut ours, "f1", &["c", "a", "b"]);
        reorder(&mut theirs, "f1", &["a", "c", "b"]);

        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert_eq!(cmp.conflicts.len(), 1);
        assert_eq!(cmp.conflicts[0].kind, ConflictKind::MoveMove);
        let sides: Vec<Side> = cmp.members(&cmp.conflicts[0]).map(|d| d.source).collect();
        assert_eq!(sides, vec![Side::Left, Side::Right]);
        assert_eq!(cmp.count_from(Side::Both), 0);
    }

    #[test]
    fn test_three_way_same_reorder_collapses_despite_one_sided_insert() {
        let base = with_third_element();
        let mut ours = base.clone();
        let mut theirs = base.clone();
        reorder(&mut ours, "f1", &["c", "a", "b"]);
        reorder(&mut theirs, "f1", &["c", "a", "b"]);
        // An insertion in front of the moved node on our side only.
        ours.add_child(&"f1".into(), Node::new("x", "element"));
        reorder(&mut ours, "f1", &["x", "c", "a", "b"]);

        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert!(!cmp.has_conflicts());
        let moves: Vec<&Difference> = cmp
            .differences
            .iter()
            .filter(|d| matches!(d.kind, DifferenceKind::ContainmentMove { .. }))
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].source, Side::Both);
    }

    #[test]
    fn test_three_way_embedded_replacement_conflicts_with_edit() {
        let base = sample();
        let mut ours = sample();
        let mut theirs = sample();
        ours.node_mut(&"v1".into()).unwrap().embedded.insert(
            "bounds".into(),
            Embedded::new("polyline").with("points", Value::Int(3)),
        );
        set(&mut theirs, "v1", "unused", Value::Int(0));
        theirs
            .node_mut(&"v1".into())
            .unwrap()
            .embedded
            .get_mut("bounds")
            .unwrap()
            .attributes
            .insert("x".into(), Value::Int(99));

        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        assert_eq!(cmp.conflicts.len(), 1);
        let conflict = &cmp.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::DeleteModify);
        let bounds = NodeKey::Embedded {
            parent: "v1".into(),
            role: "bounds".into(),
        };
        let members: Vec<&Difference> = cmp.members(conflict).collect();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|d| d.key == bounds));
        // The unrelated attribute on v1 itself stays clean.
        let unrelated = cmp
            .differences
            .iter()
            .find(|d| d.kind.attribute() == Some("unused"))
            .unwrap();
        assert!(!unrelated.conflict);
    }

    #[test]
    fn test_three_way_move_move_and_add_add() {
        let base = sample();
        let mut ours = sample();
        let mut theirs = sample();
        ours.detach(&"b".into());
        ours.attach_after(&"model".into(), "b".into(), None);
        theirs.detach(&"b".into());
        theirs.attach_after(&"v1".into(), "b".into(), None);
        ours.add_child(&"f1".into(), Node::new("n", "element").with("name", Value::text("x")));
        theirs.add_child(&"f1".into(), Node::new("n", "element").with("name", Value::text("y")));

        let cmp = StructuralComparator::three_way(&ours, &theirs, &base);
        let kinds: Vec<ConflictKind> = cmp.conflicts.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ConflictKind::MoveMove, ConflictKind::AddAdd]);
        assert!(cmp
            .conflicts
            .iter()
            .all(|c| c.category() == ConflictCategory::Containment));
    }
}
