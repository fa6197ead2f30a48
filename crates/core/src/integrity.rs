//! Integrity checking of documents before they are persisted.
//!
//! Two checks always run: every reference must resolve to a node of the same
//! document, and every referenced attachment must exist in the content
//! store. Schema owners register further validators; the checker runs all of
//! them and aggregates what they report. A failed check is data, not an
//! error: the merge engine uses it to decide on the fallback path.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{Document, NodeId};

/// Rule name of the built-in reference check.
pub const DANGLING_REFERENCE: &str = "dangling_reference";
/// Rule name of the built-in attachment check.
pub const MISSING_ATTACHMENT: &str = "missing_attachment";

/// One specific problem found in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Node the problem is attributed to.
    pub node: NodeId,
    /// Name of the check or validator that reported it.
    pub rule: String,
    pub reason: String,
}

impl Violation {
    /// A violation whose rule is filled in by the checker.
    pub fn new(node: impl Into<NodeId>, reason: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            rule: String::new(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.node, self.reason)
    }
}

/// Outcome of [`IntegrityChecker::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// A pure structural rule over a whole document.
pub type Validator = Box<dyn Fn(&Document) -> Vec<Violation> + Send + Sync>;

/// Runs the built-in checks plus every registered validator.
#[derive(Default)]
pub struct IntegrityChecker {
    validators: Vec<(String, Validator)>,
}

impl fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.validators.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("IntegrityChecker")
            .field("validators", &names)
            .finish()
    }
}

impl IntegrityChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator under `name`, the rule reported on its
    /// violations.
    pub fn register<F>(&mut self, name: impl Into<String>, validator: F) -> &mut Self
    where
        F: Fn(&Document) -> Vec<Violation> + Send + Sync + 'static,
    {
        self.validators.push((name.into(), Box::new(validator)));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Document) -> Vec<Violation> + Send + Sync + 'static,
    {
        self.register(name, validator);
        self
    }

    pub fn validator_names(&self) -> impl Iterator<Item = &str> {
        self.validators.iter().map(|(n, _)| n.as_str())
    }

    pub fn check(&self, document: &Document) -> IntegrityReport {
        let mut violations = Vec::new();

        for (holder, attribute, target) in document.references() {
            if !document.contains(target) {
                violations.push(Violation {
                    node: holder.owner().clone(),
                    rule: DANGLING_REFERENCE.into(),
                    reason: format!("{}.{} refers to missing node {}", holder, attribute, target),
                });
            }
        }

        for (holder, path) in document.attachment_refs() {
            if !document.attachments().contains_key(path) {
                violations.push(Violation {
                    node: holder.owner().clone(),
                    rule: MISSING_ATTACHMENT.into(),
                    reason: format!("attachment '{}' is not in the content store", path),
                });
            }
        }

        for (name, validator) in &self.validators {
            let found = validator(document);
            debug!(validator = %name, violations = found.len(), "validator ran");
            violations.extend(found.into_iter().map(|mut v| {
                v.rule = name.clone();
                v
            }));
        }

        info!(
            violations = violations.len(),
            validators = self.validators.len(),
            "integrity check complete"
        );
        IntegrityReport { violations }
    }
}

/// Stock validators for common schema rules.
pub mod validators {
    use super::*;

    /// Containment is a tree: every node except the root has exactly one
    /// parent, the root has none, children exist, and every node is
    /// reachable from the root.
    pub fn containment_tree(document: &Document) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut parent_count: BTreeMap<&NodeId, usize> = BTreeMap::new();
        for node in document.nodes() {
            for child in &node.children {
                if !document.contains(child) {
                    violations.push(Violation::new(
                        node.id.clone(),
                        format!("child {} does not exist", child),
                    ));
                }
                *parent_count.entry(child).or_default() += 1;
            }
        }

        let reachable: BTreeSet<NodeId> = document.pre_order().into_iter().collect();
        for node in document.nodes() {
            let parents = parent_count.get(&node.id).copied().unwrap_or(0);
            if &node.id == document.root() {
                if parents > 0 {
                    violations.push(Violation::new(node.id.clone(), "root is contained"));
                }
                continue;
            }
            if parents > 1 {
                violations.push(Violation::new(
                    node.id.clone(),
                    format!("contained by {} parents", parents),
                ));
            }
            if !reachable.contains(&node.id) {
                violations.push(Violation::new(
                    node.id.clone(),
                    "not reachable from the root",
                ));
            }
        }
        violations
    }

    /// Exactly one node of type `kind` must exist.
    pub fn required_singleton(
        kind: impl Into<String>,
    ) -> impl Fn(&Document) -> Vec<Violation> + Send + Sync + 'static {
        let kind = kind.into();
        move |document: &Document| {
            let found: Vec<&NodeId> = document
                .nodes()
                .filter(|n| n.kind == kind)
                .map(|n| &n.id)
                .collect();
            match found.len() {
                1 => Vec::new(),
                0 => vec![Violation::new(
                    document.root().clone(),
                    format!("required '{}' node is missing", kind),
                )],
                n => found
                    .into_iter()
                    .map(|id| {
                        Violation::new(id.clone(), format!("one of {} '{}' nodes", n, kind))
                    })
                    .collect(),
            }
        }
    }
}
