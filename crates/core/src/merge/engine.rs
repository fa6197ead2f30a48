//! Merge orchestration.
//!
//! One call to [`MergeEngine::merge`] walks a fixed state machine:
//!
//! ```text
//! Start -> FastForwardCheck -> FastForward
//!                           -> ThreeWayMerge -> Applied -> Validate -> Commit
//!                                                                   -> ConflictFallback -> Commit
//!                                                                                       -> Cancelled
//! ```
//!
//! The repository lock is held from the fast-forward check until the merge
//! commit exists or the repository has been reset. Tracked files must be
//! unmodified before anything is checked out, so a reset never discards
//! user work. Every failure after git
//! started touching the working tree resets it to the pre-merge HEAD before
//! the error is returned.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::compare::{
    apply, Comparison, ConflictKind, Difference, DifferenceKind, Side, StructuralComparator,
};
use crate::document_io::DocumentIo;
use crate::errors::MergeError;
use crate::integrity::{IntegrityChecker, Violation};
use crate::merge::policy::{
    ConflictPolicy, FallbackChoice, FallbackReport, FallbackResolver, FixedFallback, Preference,
};
use crate::model::{Document, NodeId, NodeKey};
use crate::store::{CommitHandle, MergeStatus, MergeStrategy, RevisionStore};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// States of one merge invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Start,
    FastForwardCheck,
    FastForward,
    ThreeWayMerge,
    Applied,
    Validate,
    ConflictFallback,
    Commit,
    Cancelled,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::FastForwardCheck => write!(f, "fast_forward_check"),
            Self::FastForward => write!(f, "fast_forward"),
            Self::ThreeWayMerge => write!(f, "three_way_merge"),
            Self::Applied => write!(f, "applied"),
            Self::Validate => write!(f, "validate"),
            Self::ConflictFallback => write!(f, "conflict_fallback"),
            Self::Commit => write!(f, "commit"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Statistics of a three-way merge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub branch: String,
    pub differences: usize,
    pub conflicts: usize,
    pub applied: usize,
    pub skipped: usize,
    pub resolved_ours: usize,
    pub resolved_theirs: usize,
    pub attachments_repaired: usize,
    pub violations: Vec<Violation>,
    /// Non-document paths git left conflicted.
    pub conflicted_paths: Vec<String>,
}

/// Terminal result of a merge.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Nothing to integrate.
    AlreadyUpToDate,
    /// HEAD moved to the target; no commit was created.
    FastForwarded { to: CommitHandle },
    /// The structural merge was committed.
    Merged {
        commit: CommitHandle,
        report: MergeReport,
    },
    /// The structural merge was abandoned and one side committed wholesale.
    MergedWithConflictsResolved {
        side: Preference,
        commit: CommitHandle,
        report: MergeReport,
    },
    /// The repository was reset to the pre-merge HEAD.
    Cancelled,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyUpToDate => write!(f, "already up to date"),
            Self::FastForwarded { to } => write!(f, "fast-forwarded to {}", to.short_id()),
            Self::Merged { commit, .. } => write!(f, "merged as {}", commit.short_id()),
            Self::MergedWithConflictsResolved { side, commit, .. } => {
                write!(f, "merged as {} taking {} wholesale", commit.short_id(), side)
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Merges branches of one repository's document.
///
/// The engine owns no process-wide state; everything it uses is passed in
/// by the hosting application.
pub struct MergeEngine<'a> {
    store: &'a RevisionStore,
    io: &'a dyn DocumentIo,
    checker: IntegrityChecker,
    policy: ConflictPolicy,
    strategy: MergeStrategy,
    fallback: Box<dyn FallbackResolver + 'a>,
}

impl<'a> MergeEngine<'a> {
    /// Engine with default policy, no extra validators, and a fallback that
    /// cancels.
    pub fn new(store: &'a RevisionStore, io: &'a dyn DocumentIo) -> Self {
        Self {
            store,
            io,
            checker: IntegrityChecker::new(),
            policy: ConflictPolicy::default(),
            strategy: MergeStrategy::default(),
            fallback: Box::new(FixedFallback::default()),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How git treats conflicting hunks of non-document files.
    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_checker(mut self, checker: IntegrityChecker) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_fallback(mut self, fallback: impl FallbackResolver + 'a) -> Self {
        self.fallback = Box::new(fallback);
        self
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Merge `branch` into the current HEAD.
    #[instrument(skip(self))]
    pub fn merge(&self, branch: &str) -> Result<MergeOutcome, MergeError> {
        enter(MergeState::Start);
        let head = self.store.head()?;
        let target = self.store.resolve(branch)?;
        if self.store.is_ancestor(&target, &head)? {
            info!(head = %head.short_id(), "already up to date");
            return Ok(MergeOutcome::AlreadyUpToDate);
        }

        let lock = self.store.lock("merge")?;
        let dirty = self.store.modified_paths()?;
        if !dirty.is_empty() {
            warn!(paths = dirty.len(), "refusing to merge over uncommitted changes");
            return Err(MergeError::DirtyWorkingTree { paths: dirty });
        }

        enter(MergeState::FastForwardCheck);
        if self.store.is_ancestor(&head, &target)? {
            enter(MergeState::FastForward);
            if let Err(e) = self.store.fast_forward_to(&target) {
                self.reset_after_failure(&head);
                return Err(e.into());
            }
            lock.release()?;
            info!(to = %target.short_id(), "fast-forwarded");
            return Ok(MergeOutcome::FastForwarded { to: target });
        }

        let current = self.store.current_branch()?.ok_or(MergeError::DetachedHead)?;
        if self.store.merge_base(&head, &target)?.is_none() {
            return Err(MergeError::UnrelatedHistories {
                ours: head.short_id(),
                theirs: target.short_id(),
            });
        }

        enter(MergeState::ThreeWayMerge);
        let outcome = self
            .store
            .low_level_merge(branch, self.strategy)
            .map_err(MergeError::from)
            .and_then(|status| match status {
                MergeStatus::UpToDate => Ok(MergeOutcome::AlreadyUpToDate),
                MergeStatus::Staged {
                    ours,
                    theirs,
                    base,
                    conflicted_paths,
                } => self.structural_merge(
                    branch,
                    &current,
                    &ours,
                    &theirs,
                    &base,
                    conflicted_paths,
                ),
            });

        match outcome {
            Ok(outcome) => {
                lock.release()?;
                info!(%outcome, "merge finished");
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "merge failed; resetting to pre-merge HEAD");
                self.reset_after_failure(&head);
                Err(e)
            }
        }
    }

    fn structural_merge(
        &self,
        branch: &str,
        current: &str,
        ours: &CommitHandle,
        theirs: &CommitHandle,
        base: &CommitHandle,
        conflicted_paths: Vec<String>,
    ) -> Result<MergeOutcome, MergeError> {
        let ours_snap = self.store.extract_snapshot(&ours.id.to_string(), self.io)?;
        let theirs_snap = self.store.extract_snapshot(&theirs.id.to_string(), self.io)?;
        let base_snap = self.store.extract_snapshot(&base.id.to_string(), self.io)?;

        let comparison = StructuralComparator::three_way(
            ours_snap.document(),
            theirs_snap.document(),
            base_snap.document(),
        );
        let mut report = MergeReport {
            branch: branch.to_string(),
            differences: comparison.differences.len(),
            conflicts: comparison.conflicts.len(),
            ..Default::default()
        };

        // Ours already carries its own changes; bring in theirs.
        let mut merged = self.io.clone_document(ours_snap.document());
        let applied = apply(
            &mut merged,
            comparison
                .non_conflicting()
                .filter(|d| d.source == Side::Right),
        );
        report.applied += applied.applied;
        report.skipped += applied.skipped;

        resolve_conflicts(
            &self.policy,
            &comparison,
            &mut merged,
            theirs_snap.document(),
            &mut report,
        );
        report.attachments_repaired =
            self.repair_attachments(&mut merged, theirs_snap.document(), ours_snap.document());
        enter(MergeState::Applied);

        enter(MergeState::Validate);
        let integrity = self.checker.check(&merged);
        let document_path = self.store.document_path().to_string_lossy().into_owned();
        report.violations = integrity.violations;
        report.conflicted_paths = conflicted_paths
            .into_iter()
            .filter(|p| *p != document_path)
            .collect();

        let message = self.commit_message(branch, current);
        if report.violations.is_empty() && report.conflicted_paths.is_empty() {
            enter(MergeState::Commit);
            self.io.save(&merged, &self.store.working_document_path())?;
            let commit = self.store.commit_merge(&message, &[ours, theirs])?;
            return Ok(MergeOutcome::Merged { commit, report });
        }

        enter(MergeState::ConflictFallback);
        let fallback = FallbackReport {
            branch: branch.to_string(),
            violations: report.violations.clone(),
            conflicted_paths: report.conflicted_paths.clone(),
        };
        let choice = self.fallback.choose(&fallback);
        info!(
            %choice,
            violations = fallback.violations.len(),
            conflicted_paths = fallback.conflicted_paths.len(),
            "conflict fallback"
        );
        let (side, handle) = match choice {
            FallbackChoice::Cancel => {
                enter(MergeState::Cancelled);
                self.store.reset_to(ours)?;
                return Ok(MergeOutcome::Cancelled);
            }
            FallbackChoice::TakeOurs => (Preference::Ours, ours),
            FallbackChoice::TakeTheirs => (Preference::Theirs, theirs),
        };
        self.store.checkout_side(handle)?;
        enter(MergeState::Commit);
        let commit = self.store.commit_merge(&message, &[ours, theirs])?;
        Ok(MergeOutcome::MergedWithConflictsResolved {
            side,
            commit,
            report,
        })
    }

    /// Copy attachments the merged document references but lacks, from
    /// theirs first and then ours.
    fn repair_attachments(&self, merged: &mut Document, theirs: &Document, ours: &Document) -> usize {
        let missing: BTreeSet<String> = merged
            .attachment_refs()
            .into_iter()
            .map(|(_, path)| path.to_string())
            .filter(|path| !merged.attachments().contains_key(path))
            .collect();
        let mut repaired = 0;
        for path in missing {
            let bytes = self
                .io
                .attachment_bytes(theirs, &path)
                .or_else(|| self.io.attachment_bytes(ours, &path))
                .map(<[u8]>::to_vec);
            if let Some(bytes) = bytes {
                self.io.add_attachment(merged, &path, bytes);
                debug!(path = %path, "attachment repaired");
                repaired += 1;
            }
        }
        repaired
    }

    fn commit_message(&self, branch: &str, current: &str) -> String {
        if self.store.is_remote_branch(branch) {
            format!("Merge remote-tracking branch '{}' into {}", branch, current)
        } else {
            format!("Merge branch '{}' into {}", branch, current)
        }
    }

    fn reset_after_failure(&self, head: &CommitHandle) {
        if let Err(e) = self.store.reset_to(head) {
            warn!(error = %e, head = %head.short_id(), "reset after failed merge also failed");
        }
    }
}

fn enter(state: MergeState) {
    debug!(%state, "merge state");
}

// ---------------------------------------------------------------------------
// Conflict resolution
// ---------------------------------------------------------------------------

/// Settle every conflict of `comparison` on `merged` (a copy of ours with
/// theirs' clean changes applied) according to `policy`.
///
/// Ours winning needs no edit. Theirs winning replays theirs' side of the
/// conflict; when ours had deleted or replaced what theirs kept, that part
/// is first restored from `theirs`.
fn resolve_conflicts(
    policy: &ConflictPolicy,
    comparison: &Comparison,
    merged: &mut Document,
    theirs: &Document,
    report: &mut MergeReport,
) {
    for conflict in &comparison.conflicts {
        let winner = policy.winner(conflict.category());
        debug!(kind = %conflict.kind, %winner, "resolving conflict");
        if winner == Preference::Ours {
            report.resolved_ours += 1;
            continue;
        }
        report.resolved_theirs += 1;

        let members: Vec<&Difference> = comparison.members(conflict).collect();
        for d in &members {
            let ours_removed = d.source == Side::Left
                && match (&d.key, &d.kind) {
                    (_, DifferenceKind::ContainmentDelete { .. }) => true,
                    (NodeKey::Embedded { .. }, DifferenceKind::ContainmentAdd { .. }) => true,
                    _ => false,
                };
            if ours_removed {
                restore(merged, theirs, &d.key);
            }
        }
        if conflict.kind == ConflictKind::AddAdd {
            for d in &members {
                if let (Side::Right, NodeKey::Node(id)) = (d.source, &d.key) {
                    adopt(merged, theirs, id);
                }
            }
        }

        // Nodes already brought back by a restore or adopted above are
        // skipped here.
        let replay: Vec<&Difference> = members
            .iter()
            .copied()
            .filter(|d| {
                d.source == Side::Right
                    && !(matches!(d.kind, DifferenceKind::ContainmentAdd { .. })
                        && matches!(d.key, NodeKey::Node(_))
                        && merged.contains_key(&d.key))
            })
            .collect();
        let result = apply(merged, replay);
        report.applied += result.applied;
        report.skipped += result.skipped;
    }
}

/// Re-create what `key` names in `merged` from `theirs`.
///
/// A node comes back with every descendant `merged` lacks; descendants
/// living elsewhere in `merged` stay where they are. Ancestors `merged`
/// lost as well come back too, without their other children. An embedded
/// object is replaced by theirs' version.
fn restore(merged: &mut Document, theirs: &Document, key: &NodeKey) {
    match key {
        NodeKey::Node(id) => {
            if merged.contains(id) {
                return;
            }
            let Some(chain) = missing_ancestors(merged, theirs, id) else {
                warn!(node = %id, "cannot restore node: no ancestor left to attach to");
                return;
            };
            for ancestor in chain.iter().rev() {
                if let Some(source) = theirs.node(ancestor) {
                    let mut bare = source.clone();
                    bare.children.clear();
                    merged.insert_detached(bare);
                    attach_like(merged, theirs, ancestor);
                    debug!(node = %ancestor, "restored ancestor from theirs");
                }
            }
            restore_subtree(merged, theirs, id);
            attach_like(merged, theirs, id);
            debug!(node = %id, "restored from theirs");
        }
        NodeKey::Embedded { parent, role } => {
            let Some(embedded) = theirs.embedded(parent, role).cloned() else {
                return;
            };
            if let Some(owner) = merged.node_mut(parent) {
                owner.embedded.insert(role.clone(), embedded);
                debug!(owner = %parent, role = %role, "restored embedded object from theirs");
            }
        }
    }
}

/// Ancestors of `id` in `theirs` that `merged` lacks, nearest first, up to
/// the first one `merged` still has. `None` when there is no such ancestor.
fn missing_ancestors(merged: &Document, theirs: &Document, id: &NodeId) -> Option<Vec<NodeId>> {
    let parents = theirs.parent_index();
    let mut chain = Vec::new();
    let mut cursor = id;
    loop {
        let parent = parents.get(cursor)?;
        if merged.contains(parent) {
            return Some(chain);
        }
        if chain.len() >= parents.len() {
            return None;
        }
        chain.push(parent.clone());
        cursor = parent;
    }
}

/// Attach `id` under its parent in `theirs`, after the same sibling.
fn attach_like(merged: &mut Document, theirs: &Document, id: &NodeId) {
    if let Some(parent) = theirs.parent_of(id) {
        let anchor = previous_sibling(theirs, parent, id);
        merged.attach_after(parent, id.clone(), anchor.as_ref());
    }
}

fn restore_subtree(merged: &mut Document, theirs: &Document, id: &NodeId) {
    let Some(source) = theirs.node(id) else {
        return;
    };
    let mut node = source.clone();
    node.children.retain(|c| !merged.contains(c));
    let children = node.children.clone();
    merged.insert_detached(node);
    for child in &children {
        restore_subtree(merged, theirs, child);
    }
}

/// Give an identifier both sides added theirs' content and position.
fn adopt(merged: &mut Document, theirs: &Document, id: &NodeId) {
    let Some(source) = theirs.node(id) else {
        return;
    };
    if let Some(node) = merged.node_mut(id) {
        node.kind = source.kind.clone();
        node.attributes = source.attributes.clone();
        node.embedded = source.embedded.clone();
    }
    if let Some(parent) = theirs.parent_of(id) {
        if merged.contains(parent) && !merged.is_in_subtree(parent, id) {
            let anchor = previous_sibling(theirs, parent, id);
            merged.detach(id);
            merged.attach_after(parent, id.clone(), anchor.as_ref());
        }
    }
}

fn previous_sibling(document: &Document, parent: &NodeId, id: &NodeId) -> Option<NodeId> {
    let children = &document.node(parent)?.children;
    let i = children.iter().position(|c| c == id)?;
    i.checked_sub(1).map(|i| children[i].clone())
}
