//! Read-only snapshot of every local and remote-tracking branch.

use std::collections::BTreeSet;

use git2::{BranchType, Oid};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::RepositoryError;
use crate::store::revision_store::{CommitHandle, RevisionStore};

/// Where a branch lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Local,
    Remote,
}

/// Relationship between a branch and its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    /// Local branch with no upstream configured.
    LocalOnly,
    /// Remote-tracking branch no local branch follows.
    RemoteOnly,
    /// Local branch following an existing upstream.
    Tracking { ahead: usize, behind: usize },
    /// Upstream is configured but the remote ref is gone.
    UpstreamDeleted,
    /// Remote-tracking branch followed by some local branch.
    TrackedRemote,
}

/// Status of one branch.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    /// Short name (`feature`, `origin/feature`).
    pub name: String,
    /// Full ref name (`refs/heads/feature`).
    pub full_ref: String,
    pub kind: BranchKind,
    pub is_current: bool,
    pub tracking: TrackingStatus,
    /// Commits on this branch not reachable from HEAD.
    pub ahead_of_head: usize,
    /// Commits on HEAD not reachable from this branch.
    pub behind_head: usize,
    /// Whether the branch tip is already part of HEAD's history.
    pub merged_into_current: bool,
    pub latest: CommitHandle,
}

impl BranchInfo {
    /// Unpushed commits exist.
    pub fn has_unpushed(&self) -> bool {
        matches!(self.tracking, TrackingStatus::Tracking { ahead, .. } if ahead > 0)
    }

    /// Upstream holds commits not yet integrated locally.
    pub fn has_unintegrated(&self) -> bool {
        matches!(self.tracking, TrackingStatus::Tracking { behind, .. } if behind > 0)
    }
}

/// All branches of a repository at one instant, sorted local first then by
/// name.
#[derive(Debug, Clone, Default)]
pub struct BranchStatus {
    pub branches: Vec<BranchInfo>,
}

impl BranchStatus {
    pub fn current(&self) -> Option<&BranchInfo> {
        self.branches.iter().find(|b| b.is_current)
    }

    pub fn local_only(&self) -> impl Iterator<Item = &BranchInfo> {
        self.with_tracking(|t| matches!(t, TrackingStatus::LocalOnly))
    }

    pub fn remote_only(&self) -> impl Iterator<Item = &BranchInfo> {
        self.with_tracking(|t| matches!(t, TrackingStatus::RemoteOnly))
    }

    pub fn upstream_deleted(&self) -> impl Iterator<Item = &BranchInfo> {
        self.with_tracking(|t| matches!(t, TrackingStatus::UpstreamDeleted))
    }

    pub fn unpushed(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.iter().filter(|b| b.has_unpushed())
    }

    pub fn unintegrated(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.iter().filter(|b| b.has_unintegrated())
    }

    pub fn find(&self, name: &str) -> Option<&BranchInfo> {
        self.branches.iter().find(|b| b.name == name)
    }

    fn with_tracking(
        &self,
        pred: impl Fn(&TrackingStatus) -> bool,
    ) -> impl Iterator<Item = &BranchInfo> {
        self.branches.iter().filter(move |b| pred(&b.tracking))
    }
}

impl RevisionStore {
    /// Classify every branch relative to HEAD and its upstream.
    pub fn branch_statuses(&self) -> Result<BranchStatus, RepositoryError> {
        let repo = &self.repo;
        let head: Option<Oid> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id());

        // Upstream refs followed by some local branch.
        let mut followed = BTreeSet::new();
        for item in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = item?;
            if let Some(refname) = branch.get().name() {
                if let Ok(upstream) = repo.branch_upstream_name(refname) {
                    if let Some(up) = upstream.as_str() {
                        followed.insert(up.to_string());
                    }
                }
            }
        }

        let mut branches = Vec::new();
        for item in repo.branches(None)? {
            let (branch, branch_type) = item?;
            let reference = branch.get();
            let (Some(name), Some(full_ref)) = (branch.name()?, reference.name()) else {
                continue;
            };
            if branch_type == BranchType::Remote && reference.symbolic_target().is_some() {
                // origin/HEAD
                continue;
            }
            let name = name.to_string();
            let full_ref = full_ref.to_string();
            let tip = reference.peel_to_commit()?;

            let tracking = match branch_type {
                BranchType::Local => match repo.branch_upstream_name(&full_ref) {
                    Ok(upstream) => {
                        let upstream = upstream.as_str().unwrap_or_default().to_string();
                        match repo.refname_to_id(&upstream) {
                            Ok(up_oid) => {
                                let (ahead, behind) = repo.graph_ahead_behind(tip.id(), up_oid)?;
                                TrackingStatus::Tracking { ahead, behind }
                            }
                            Err(_) => TrackingStatus::UpstreamDeleted,
                        }
                    }
                    Err(_) => TrackingStatus::LocalOnly,
                },
                BranchType::Remote => {
                    if followed.contains(&full_ref) {
                        TrackingStatus::TrackedRemote
                    } else {
                        TrackingStatus::RemoteOnly
                    }
                }
            };

            let (ahead_of_head, behind_head, merged_into_current) = match head {
                Some(h) => {
                    let (ahead, behind) = repo.graph_ahead_behind(tip.id(), h)?;
                    (ahead, behind, ahead == 0)
                }
                None => (0, 0, false),
            };

            branches.push(BranchInfo {
                name,
                full_ref,
                kind: match branch_type {
                    BranchType::Local => BranchKind::Local,
                    BranchType::Remote => BranchKind::Remote,
                },
                is_current: branch.is_head(),
                tracking,
                ahead_of_head,
                behind_head,
                merged_into_current,
                latest: CommitHandle::from_commit(&tip),
            });
        }

        branches.sort_by(|a, b| {
            (a.kind == BranchKind::Remote, &a.name).cmp(&(b.kind == BranchKind::Remote, &b.name))
        });
        debug!(count = branches.len(), "branch statuses computed");
        Ok(BranchStatus { branches })
    }
}
