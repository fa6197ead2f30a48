//! Document model: the typed object graph that is versioned in the repository.
//!
//! A [`Document`] is a flat table of identified [`Node`]s. Containment is
//! expressed through each node's ordered `children` list and forms a tree
//! rooted at [`Document::root`]. Non-containment relationships are
//! reference-valued attributes ([`Value::Ref`], [`Value::RefList`]) and may
//! form an arbitrary graph. Value objects without identity live inside their
//! owning node as [`Embedded`] entries keyed by role.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::CommitHandle;

// ---------------------------------------------------------------------------
// Identifiers and keys
// ---------------------------------------------------------------------------

/// Stable, document-unique node identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Match key of anything the comparator can pair across two documents.
///
/// Identified nodes match by identifier. Embedded value objects have no
/// identity of their own and match by `(parent identifier, role)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    Node(NodeId),
    Embedded { parent: NodeId, role: String },
}

impl NodeKey {
    /// The identified node this key belongs to (itself, or the owner of an
    /// embedded object).
    pub fn owner(&self) -> &NodeId {
        match self {
            Self::Node(id) => id,
            Self::Embedded { parent, .. } => parent,
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{}", id),
            Self::Embedded { parent, role } => write!(f, "{}#{}", parent, role),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A scalar or reference-valued attribute.
///
/// References compare by the identifier of the target, never by the target's
/// content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Ref(NodeId),
    RefList(Vec<NodeId>),
    /// Path of a binary attachment in the document's content store.
    Attachment(String),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Identifiers this value points at.
    pub fn referenced_ids(&self) -> Vec<&NodeId> {
        match self {
            Self::Ref(id) => vec![id],
            Self::RefList(ids) => ids.iter().collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Ref(id) => write!(f, "-> {}", id),
            Self::RefList(ids) => {
                let ids: Vec<&str> = ids.iter().map(NodeId::as_str).collect();
                write!(f, "-> [{}]", ids.join(", "))
            }
            Self::Attachment(p) => write!(f, "@{}", p),
        }
    }
}

pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A value object owned by a node under a role (layout bounds, bendpoints).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embedded {
    pub kind: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Embedded {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// An identified node of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub embedded: BTreeMap<String, Embedded>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            attributes: Attributes::new(),
            children: Vec::new(),
            embedded: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_embedded(mut self, role: impl Into<String>, value: Embedded) -> Self {
        self.embedded.insert(role.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The versioned object graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    root: NodeId,
    nodes: BTreeMap<NodeId, Node>,
    /// Content store: attachment path to raw bytes.
    #[serde(default, with = "crate::document_io::base64_map")]
    attachments: BTreeMap<String, Vec<u8>>,
}

impl Document {
    /// Create a document holding only a root node.
    pub fn new(root: Node) -> Self {
        let id = root.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(id.clone(), root);
        Self {
            root: id,
            nodes,
            attachments: BTreeMap::new(),
        }
    }

    /// Mint a fresh identifier for a node created by an editor.
    pub fn new_id() -> NodeId {
        NodeId(uuid::Uuid::new_v4().to_string())
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// All nodes ordered by identifier.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn contains_key(&self, key: &NodeKey) -> bool {
        match key {
            NodeKey::Node(id) => self.contains(id),
            NodeKey::Embedded { parent, role } => self
                .node(parent)
                .is_some_and(|n| n.embedded.contains_key(role)),
        }
    }

    pub fn embedded(&self, parent: &NodeId, role: &str) -> Option<&Embedded> {
        self.node(parent).and_then(|n| n.embedded.get(role))
    }

    /// Append `node` as the last child of `parent`.
    ///
    /// Returns `false` (and leaves the document untouched) when the parent is
    /// missing or the identifier is already in use.
    pub fn add_child(&mut self, parent: &NodeId, node: Node) -> bool {
        if self.nodes.contains_key(&node.id) || !self.nodes.contains_key(parent) {
            return false;
        }
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(id);
        }
        true
    }

    /// Insert a node into the table without attaching it anywhere.
    pub(crate) fn insert_detached(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Map of child identifier to containing parent identifier.
    pub fn parent_index(&self) -> BTreeMap<NodeId, NodeId> {
        let mut parents = BTreeMap::new();
        for node in self.nodes.values() {
            for child in &node.children {
                parents.insert(child.clone(), node.id.clone());
            }
        }
        parents
    }

    pub fn parent_of(&self, id: &NodeId) -> Option<&NodeId> {
        self.nodes
            .values()
            .find(|n| n.children.contains(id))
            .map(|n| &n.id)
    }

    /// Identifiers in containment pre-order starting at the root.
    ///
    /// Cycles are cut (a node is visited at most once) and unreachable
    /// nodes are not listed.
    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut seen = BTreeSet::new();
        let mut stack = vec![self.root.clone()];
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                for child in node.children.iter().rev() {
                    stack.push(child.clone());
                }
            }
            order.push(id);
        }
        order
    }

    /// True if `candidate` is `ancestor` or lies in its containment subtree.
    pub fn is_in_subtree(&self, candidate: &NodeId, ancestor: &NodeId) -> bool {
        let mut stack = vec![ancestor];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == candidate {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.children.iter());
            }
        }
        false
    }

    /// Detach `id` from whichever parent currently contains it.
    ///
    /// Scans every node; callers holding a [`Document::parent_index`] use
    /// [`Document::detach_from`] instead.
    pub(crate) fn detach(&mut self, id: &NodeId) {
        for node in self.nodes.values_mut() {
            node.children.retain(|c| c != id);
        }
    }

    /// Detach `id` from `parent` only.
    pub(crate) fn detach_from(&mut self, parent: &NodeId, id: &NodeId) {
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.retain(|c| c != id);
        }
    }

    /// Place `id` under `parent` right after `anchor`, or first when
    /// `anchor` is `None`. Falls back to appending when the anchor is not a
    /// child of `parent`.
    pub(crate) fn attach_after(&mut self, parent: &NodeId, id: NodeId, anchor: Option<&NodeId>) {
        if let Some(p) = self.nodes.get_mut(parent) {
            let position = match anchor {
                None => 0,
                Some(a) => match p.children.iter().rposition(|c| c == a) {
                    Some(i) => i + 1,
                    None => p.children.len(),
                },
            };
            p.children.insert(position, id);
        }
    }

    /// Remove `id` and its entire containment subtree. Returns the removed
    /// identifiers.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Vec<NodeId> {
        if id == &self.root {
            return Vec::new();
        }
        self.detach(id);
        self.drop_subtree(id)
    }

    /// Like [`Document::remove_subtree`] for a node already detached from
    /// its parent.
    pub(crate) fn drop_subtree(&mut self, id: &NodeId) -> Vec<NodeId> {
        if id == &self.root {
            return Vec::new();
        }
        let mut removed = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
                removed.push(current);
            }
        }
        removed
    }

    /// Every reference-valued attribute as `(holder, attribute, target)`.
    pub fn references(&self) -> Vec<(NodeKey, &str, &NodeId)> {
        let mut refs = Vec::new();
        for node in self.nodes.values() {
            for (name, value) in &node.attributes {
                for target in value.referenced_ids() {
                    refs.push((NodeKey::Node(node.id.clone()), name.as_str(), target));
                }
            }
            for (role, emb) in &node.embedded {
                for (name, value) in &emb.attributes {
                    for target in value.referenced_ids() {
                        let key = NodeKey::Embedded {
                            parent: node.id.clone(),
                            role: role.clone(),
                        };
                        refs.push((key, name.as_str(), target));
                    }
                }
            }
        }
        refs
    }

    /// Every attachment path referenced by an attribute, with its holder.
    pub fn attachment_refs(&self) -> Vec<(NodeKey, &str)> {
        let mut refs = Vec::new();
        for node in self.nodes.values() {
            for value in node.attributes.values() {
                if let Value::Attachment(path) = value {
                    refs.push((NodeKey::Node(node.id.clone()), path.as_str()));
                }
            }
            for (role, emb) in &node.embedded {
                for value in emb.attributes.values() {
                    if let Value::Attachment(path) = value {
                        let key = NodeKey::Embedded {
                            parent: node.id.clone(),
                            role: role.clone(),
                        };
                        refs.push((key, path.as_str()));
                    }
                }
            }
        }
        refs
    }

    pub fn attachments(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.attachments
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut BTreeMap<String, Vec<u8>> {
        &mut self.attachments
    }

    /// Structure-only equality: root, nodes, child order and embedded
    /// objects. Attachment bytes are content, not structure.
    pub fn structurally_eq(&self, other: &Document) -> bool {
        self.root == other.root && self.nodes == other.nodes
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable document loaded from one revision.
///
/// Cloning a snapshot shares the underlying document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    revision: CommitHandle,
    document: Arc<Document>,
}

impl Snapshot {
    pub fn new(revision: CommitHandle, document: Document) -> Self {
        Self {
            revision,
            document: Arc::new(document),
        }
    }

    pub fn revision(&self) -> &CommitHandle {
        &self.revision
    }

    pub fn document(&self) -> &Document {
        &self.document
    }
}
