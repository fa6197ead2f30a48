//! Git-backed revision store via `git2`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, Commit, Cred, FetchOptions, FileFavor, IndexAddOption, MergeOptions, Oid,
    PushOptions, RemoteCallbacks, Repository, ResetType, Signature, StatusOptions, Tree,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::document_io::DocumentIo;
use crate::errors::{not_found_or, RepositoryError};
use crate::model::Snapshot;
use crate::store::lock::RepositoryLock;

/// Default lock file name, created inside the git directory.
pub const DEFAULT_LOCK_FILE: &str = "modelmerge.lock";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An immutable, resolved commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHandle {
    pub id: Oid,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub time: DateTime<Utc>,
}

impl CommitHandle {
    pub(crate) fn from_commit(commit: &Commit<'_>) -> Self {
        let author = commit.author();
        Self {
            id: commit.id(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("").to_string(),
            author_email: author.email().unwrap_or("").to_string(),
            time: DateTime::<Utc>::from_timestamp(author.when().seconds(), 0).unwrap_or_default(),
        }
    }

    /// Abbreviated hex id.
    pub fn short_id(&self) -> String {
        let full = self.id.to_string();
        full[..7.min(full.len())].to_string()
    }

    /// First line of the commit message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

impl fmt::Display for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.short_id(), self.summary())
    }
}

/// Already-resolved transport credentials. The store never prompts.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// How git's own merge machinery treats conflicting non-document hunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Leave conflicting hunks conflicted.
    #[default]
    Recursive,
    /// Resolve conflicting hunks with our side.
    Ours,
    /// Resolve conflicting hunks with their side.
    Theirs,
}

impl MergeStrategy {
    fn file_favor(self) -> FileFavor {
        match self {
            Self::Recursive => FileFavor::Normal,
            Self::Ours => FileFavor::Ours,
            Self::Theirs => FileFavor::Theirs,
        }
    }
}

/// Result of [`RevisionStore::low_level_merge`].
#[derive(Debug, Clone)]
pub enum MergeStatus {
    /// Nothing to integrate.
    UpToDate,
    /// The working tree and index hold an uncommitted merge.
    Staged {
        ours: CommitHandle,
        theirs: CommitHandle,
        base: CommitHandle,
        /// Paths git left conflicted, sorted.
        conflicted_paths: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Repository wrapper exposing only what merge orchestration needs.
pub struct RevisionStore {
    pub(super) repo: Repository,
    repo_path: PathBuf,
    document_path: PathBuf,
    lock_file: String,
    committer: Option<(String, String)>,
}

impl RevisionStore {
    /// Open the repository at `repo_path`; `document_path` is the document's
    /// location relative to the working tree root.
    pub fn open<P: AsRef<Path>, D: AsRef<Path>>(
        repo_path: P,
        document_path: D,
    ) -> Result<Self, RepositoryError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening repository");
        let repo = Repository::open(path).map_err(|e| RepositoryError::RepositoryUnavailable {
            path: path.display().to_string(),
            reason: e.message().to_string(),
        })?;
        Self::from_repository(repo, document_path.as_ref())
    }

    /// Clone a remote repository to `path`.
    #[instrument(skip(credentials), fields(url = %url, path = %path.display()))]
    pub fn clone_repo(
        url: &str,
        path: &Path,
        document_path: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<Self, RepositoryError> {
        info!("cloning repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(credentials));
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        let repo = builder.clone(url, path)?;
        info!("clone completed");
        Self::from_repository(repo, document_path)
    }

    fn from_repository(repo: Repository, document_path: &Path) -> Result<Self, RepositoryError> {
        let repo_path = match repo.workdir() {
            Some(dir) => dir.to_path_buf(),
            None => {
                return Err(RepositoryError::RepositoryUnavailable {
                    path: repo.path().display().to_string(),
                    reason: "bare repository has no working tree".into(),
                })
            }
        };
        Ok(Self {
            repo,
            repo_path,
            document_path: document_path.to_path_buf(),
            lock_file: DEFAULT_LOCK_FILE.to_string(),
            committer: None,
        })
    }

    /// Use `name` instead of the default lock file name.
    pub fn with_lock_file(mut self, name: impl Into<String>) -> Self {
        self.lock_file = name.into();
        self
    }

    /// Sign commits as `name <email>` instead of the repository's identity.
    pub fn with_committer(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.committer = Some((name.into(), email.into()));
        self
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    /// Absolute path of the document in the working tree.
    pub fn working_document_path(&self) -> PathBuf {
        self.repo_path.join(&self.document_path)
    }

    /// Acquire the repository's exclusivity lock.
    pub fn lock(&self, operation: &str) -> Result<RepositoryLock, RepositoryError> {
        RepositoryLock::acquire(self.repo.path().join(&self.lock_file), operation)
    }

    // -----------------------------------------------------------------------
    // Revisions
    // -----------------------------------------------------------------------

    /// Resolve a branch name, remote-tracking ref, `HEAD` or hash.
    pub fn resolve(&self, revision: &str) -> Result<CommitHandle, RepositoryError> {
        let object = self
            .repo
            .revparse_single(revision)
            .map_err(|e| not_found_or(e, revision))?;
        let commit = object
            .peel_to_commit()
            .map_err(|e| not_found_or(e, revision))?;
        Ok(CommitHandle::from_commit(&commit))
    }

    pub fn head(&self) -> Result<CommitHandle, RepositoryError> {
        self.resolve("HEAD")
    }

    /// Short name of the checked-out branch, `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, RepositoryError> {
        let head = self.repo.head().map_err(|e| not_found_or(e, "HEAD"))?;
        if head.is_branch() {
            Ok(head.shorthand().map(str::to_string))
        } else {
            Ok(None)
        }
    }

    /// Whether `revision` names a remote-tracking branch.
    pub fn is_remote_branch(&self, revision: &str) -> bool {
        self.repo.find_branch(revision, BranchType::Remote).is_ok()
            && self.repo.find_branch(revision, BranchType::Local).is_err()
    }

    /// Load the document as it exists at `revision`.
    ///
    /// The blob is materialized into a scratch directory that is removed
    /// before this returns, whether loading succeeds or not.
    #[instrument(skip(self, io))]
    pub fn extract_snapshot(
        &self,
        revision: &str,
        io: &dyn DocumentIo,
    ) -> Result<Snapshot, RepositoryError> {
        let handle = self.resolve(revision)?;
        let commit = self.repo.find_commit(handle.id)?;
        let tree = commit.tree()?;
        let missing = || format!("{} at {}", self.document_path.display(), revision);
        let entry = tree
            .get_path(&self.document_path)
            .map_err(|e| not_found_or(e, missing()))?;
        let blob = self
            .repo
            .find_blob(entry.id())
            .map_err(|e| not_found_or(e, missing()))?;

        let scratch = tempfile::Builder::new()
            .prefix("modelmerge-snapshot-")
            .tempdir()?;
        let file_name = self
            .document_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("document"));
        let path = scratch.path().join(file_name);
        std::fs::write(&path, blob.content())?;

        let document = io.load(&path).map_err(|source| RepositoryError::Document {
            revision: revision.to_string(),
            source,
        })?;
        scratch.close()?;

        debug!(commit = %handle.short_id(), nodes = document.len(), "snapshot extracted");
        Ok(Snapshot::new(handle, document))
    }

    /// Nearest common ancestor, `None` when the histories are unrelated.
    pub fn merge_base(
        &self,
        a: &CommitHandle,
        b: &CommitHandle,
    ) -> Result<Option<CommitHandle>, RepositoryError> {
        match self.repo.merge_base(a.id, b.id) {
            Ok(oid) => {
                let commit = self.repo.find_commit(oid)?;
                Ok(Some(CommitHandle::from_commit(&commit)))
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `commit` is `of` or one of its ancestors.
    pub fn is_ancestor(
        &self,
        commit: &CommitHandle,
        of: &CommitHandle,
    ) -> Result<bool, RepositoryError> {
        if commit.id == of.id {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(of.id, commit.id)?)
    }

    // -----------------------------------------------------------------------
    // Merge primitives
    // -----------------------------------------------------------------------

    /// Run git's merge of `branch` into HEAD without committing.
    ///
    /// Non-document content is merged by git according to `strategy`; the
    /// three versions of the document stay available as commits for the
    /// structural merge.
    #[instrument(skip(self))]
    pub fn low_level_merge(
        &self,
        branch: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeStatus, RepositoryError> {
        let ours = self.head()?;
        let annotated = match self.repo.resolve_reference_from_short_name(branch) {
            Ok(reference) => self.repo.reference_to_annotated_commit(&reference)?,
            Err(_) => {
                let handle = self.resolve(branch)?;
                self.repo.find_annotated_commit(handle.id)?
            }
        };

        let (analysis, _) = self.repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            info!("low-level merge: already up to date");
            return Ok(MergeStatus::UpToDate);
        }

        let theirs = CommitHandle::from_commit(&self.repo.find_commit(annotated.id())?);
        let base = self
            .merge_base(&ours, &theirs)?
            .ok_or_else(|| RepositoryError::NotFound(format!("merge base of HEAD and {}", branch)))?;

        let mut merge_opts = MergeOptions::new();
        merge_opts.file_favor(strategy.file_favor());
        let mut checkout = CheckoutBuilder::new();
        checkout.allow_conflicts(true).conflict_style_merge(true);
        self.repo
            .merge(&[&annotated], Some(&mut merge_opts), Some(&mut checkout))?;

        let conflicted_paths = self.conflicted_paths()?;
        info!(
            ours = %ours.short_id(),
            theirs = %theirs.short_id(),
            base = %base.short_id(),
            conflicted = conflicted_paths.len(),
            "low-level merge staged"
        );
        Ok(MergeStatus::Staged {
            ours,
            theirs,
            base,
            conflicted_paths,
        })
    }

    /// Tracked paths whose index or working-tree content differs from HEAD,
    /// sorted. Untracked and ignored files are not reported.
    pub fn modified_paths(&self) -> Result<Vec<String>, RepositoryError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false)
            .include_ignored(false)
            .exclude_submodules(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        let paths: BTreeSet<String> = statuses
            .iter()
            .filter(|entry| !entry.status().is_empty())
            .filter_map(|entry| entry.path().map(str::to_string))
            .filter(|path| !path.ends_with(&self.lock_file))
            .collect();
        Ok(paths.into_iter().collect())
    }

    /// Paths with conflict entries in the index, sorted.
    pub fn conflicted_paths(&self) -> Result<Vec<String>, RepositoryError> {
        let index = self.repo.index()?;
        let mut paths = BTreeSet::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
            if let Some(entry) = entry {
                paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
            }
        }
        Ok(paths.into_iter().collect())
    }

    /// Replace the working tree and index wholesale with `side`'s tree,
    /// keeping the in-progress merge state.
    #[instrument(skip(self), fields(side = %side.short_id()))]
    pub fn checkout_side(&self, side: &CommitHandle) -> Result<(), RepositoryError> {
        let commit = self.repo.find_commit(side.id)?;
        let tree = commit.tree()?;
        self.remove_introduced(&tree)?;
        let mut index = self.repo.index()?;
        index.read_tree(&tree)?;
        index.write()?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo.checkout_index(Some(&mut index), Some(&mut checkout))?;
        info!("checked out one side wholesale");
        Ok(())
    }

    /// Commit the resolved working tree as a merge commit.
    ///
    /// The document and every path git left conflicted are staged from the
    /// working tree; the first parent must be the current HEAD.
    #[instrument(skip(self, message, parents))]
    pub fn commit_merge(
        &self,
        message: &str,
        parents: &[&CommitHandle],
    ) -> Result<CommitHandle, RepositoryError> {
        let mut index = self.repo.index()?;
        let mut to_stage: BTreeSet<String> = self.conflicted_paths()?.into_iter().collect();
        to_stage.insert(self.document_path.to_string_lossy().into_owned());
        for path in &to_stage {
            let rel = Path::new(path);
            if self.repo_path.join(rel).is_file() {
                index.add_path(rel)?;
            } else {
                index.remove_path(rel)?;
            }
        }
        index.write()?;
        if index.has_conflicts() {
            return Err(RepositoryError::MergeConflict(
                "index still has conflicts after staging".into(),
            ));
        }

        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let commits = parents
            .iter()
            .map(|p| self.repo.find_commit(p.id))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs: Vec<&Commit<'_>> = commits.iter().collect();
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parent_refs,
        )?;
        self.repo.cleanup_state()?;
        info!(sha = %oid, parents = parents.len(), "created merge commit");
        Ok(CommitHandle::from_commit(&self.repo.find_commit(oid)?))
    }

    /// Abandon any in-progress merge and move HEAD, index and working tree
    /// back to `target`.
    #[instrument(skip(self), fields(target = %target.short_id()))]
    pub fn reset_to(&self, target: &CommitHandle) -> Result<(), RepositoryError> {
        let commit = self.repo.find_commit(target.id)?;
        self.remove_introduced(&commit.tree()?)?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .reset(commit.as_object(), ResetType::Hard, Some(&mut checkout))?;
        self.repo.cleanup_state()?;
        info!("repository reset");
        Ok(())
    }

    /// Delete working-tree files the index tracks but `tree` does not.
    ///
    /// These are files an in-progress merge brought in; checking out or
    /// resetting to `tree` would otherwise leave them behind as untracked.
    fn remove_introduced(&self, tree: &Tree<'_>) -> Result<(), RepositoryError> {
        let index = self.repo.index()?;
        let introduced: BTreeSet<String> = index
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
            .filter(|path| tree.get_path(Path::new(path)).is_err())
            .collect();
        for path in &introduced {
            let full = self.repo_path.join(path);
            if full.is_file() {
                std::fs::remove_file(&full)?;
                debug!(path = %path, "removed file introduced by merge");
            }
        }
        Ok(())
    }

    /// Move the current branch (or detached HEAD) to `target` without
    /// creating a commit.
    #[instrument(skip(self), fields(target = %target.short_id()))]
    pub fn fast_forward_to(&self, target: &CommitHandle) -> Result<(), RepositoryError> {
        let commit = self.repo.find_commit(target.id)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        self.repo
            .checkout_tree(commit.as_object(), Some(&mut checkout))?;

        let head = self.repo.head().map_err(|e| not_found_or(e, "HEAD"))?;
        if head.is_branch() {
            let name = head
                .name()
                .ok_or_else(|| RepositoryError::NotFound("HEAD branch name".into()))?
                .to_string();
            let mut reference = self.repo.find_reference(&name)?;
            reference.set_target(target.id, "modelmerge: fast-forward")?;
            self.repo.set_head(&name)?;
        } else {
            self.repo.set_head_detached(target.id)?;
        }
        info!("fast-forwarded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Everyday collaborator operations
    // -----------------------------------------------------------------------

    /// Stage all changes and commit them on HEAD.
    #[instrument(skip(self, message))]
    pub fn commit(&self, message: &str) -> Result<CommitHandle, RepositoryError> {
        let _lock = self.lock("commit")?;
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;
        let signature = self.signature()?;
        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&Commit<'_>> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(CommitHandle::from_commit(&self.repo.find_commit(oid)?))
    }

    /// Create a local branch pointing at `at`.
    #[instrument(skip(self, at))]
    pub fn create_branch(&self, name: &str, at: &CommitHandle) -> Result<(), RepositoryError> {
        let commit = self.repo.find_commit(at.id)?;
        self.repo.branch(name, &commit, false)?;
        info!(name, at = %at.short_id(), "created branch");
        Ok(())
    }

    /// Switch the working tree and HEAD to the local branch `name`.
    #[instrument(skip(self))]
    pub fn checkout_branch(&self, name: &str) -> Result<(), RepositoryError> {
        let branch = self
            .repo
            .find_branch(name, BranchType::Local)
            .map_err(|e| not_found_or(e, name))?;
        let refname = branch
            .get()
            .name()
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))?
            .to_string();
        let target = branch.get().peel_to_commit()?;
        self.repo.checkout_tree(target.as_object(), None)?;
        self.repo.set_head(&refname)?;
        info!(name, "checked out branch");
        Ok(())
    }

    /// Fetch from a named remote.
    #[instrument(skip(self, credentials))]
    pub fn fetch(
        &self,
        remote_name: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), RepositoryError> {
        info!(remote = remote_name, "fetching");
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .map_err(|e| not_found_or(e, remote_name))?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(credentials));
        remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        debug!("fetch completed");
        Ok(())
    }

    /// Push a local branch to a remote.
    #[instrument(skip(self, credentials))]
    pub fn push(
        &self,
        remote_name: &str,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(), RepositoryError> {
        info!(remote = remote_name, branch, "pushing");
        let mut remote = self
            .repo
            .find_remote(remote_name)
            .map_err(|e| not_found_or(e, remote_name))?;
        let rejection = RefCell::new(None::<String>);
        {
            let mut callbacks = remote_callbacks(credentials);
            callbacks.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    warn!(refname, msg, "push rejected");
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut push_opts = PushOptions::new();
            push_opts.remote_callbacks(callbacks);
            let refspec = format!("refs/heads/{}:refs/heads/{}", branch, branch);
            remote.push(&[&refspec], Some(&mut push_opts))?;
        }
        if let Some(detail) = rejection.into_inner() {
            return Err(RepositoryError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    fn signature(&self) -> Result<Signature<'static>, RepositoryError> {
        if let Some((name, email)) = &self.committer {
            return Ok(Signature::now(name, email)?);
        }
        match self.repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Ok(Signature::now("modelmerge", "modelmerge@localhost")?),
        }
    }
}

fn remote_callbacks(credentials: Option<&Credentials>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(creds) = credentials {
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext(&creds.username, &creds.secret)
        });
    }
    callbacks
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::document_io::JsonDocumentIo;
    use crate::model::fixtures::sample;
    use crate::model::Value;

    #[test]
    fn test_open_missing_repository_is_unavailable() {
        let result = RevisionStore::open("/nonexistent/modelmerge", DOC);
        assert!(matches!(
            result,
            Err(RepositoryError::RepositoryUnavailable { .. })
        ));
    }

    #[test]
    fn test_resolve_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        let first = commit_doc(&store, &sample(), "initial");
        assert_eq!(store.resolve("HEAD").unwrap().id, first.id);
        assert_eq!(store.resolve(&first.id.to_string()).unwrap(), first);
        assert_eq!(first.summary(), "initial");
        assert!(matches!(
            store.resolve("no-such-branch"),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_extract_snapshot_loads_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        let doc = sample();
        let first = commit_doc(&store, &doc, "initial");

        let snapshot = store.extract_snapshot("HEAD", &JsonDocumentIo).unwrap();
        assert_eq!(snapshot.revision().id, first.id);
        assert!(snapshot.document().structurally_eq(&doc));

        // Snapshots share the document; cloning must not copy it.
        let copy = snapshot.clone();
        assert!(std::ptr::eq(copy.document(), snapshot.document()));
    }

    #[test]
    fn test_extract_snapshot_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let store = RevisionStore::open(dir.path(), "elsewhere/model.json")
            .unwrap()
            .with_committer("Test", "test@test.com");
        std::fs::write(dir.path().join("README"), "hi").unwrap();
        store.commit("no document").unwrap();
        assert!(matches!(
            store.extract_snapshot("HEAD", &JsonDocumentIo),
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_extract_snapshot_unparseable_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        std::fs::write(dir.path().join(DOC), "not json").unwrap();
        store.commit("broken").unwrap();
        assert!(matches!(
            store.extract_snapshot("HEAD", &JsonDocumentIo),
            Err(RepositoryError::Document { .. })
        ));
    }

    /// Delegates to JSON and remembers every path it was asked to load.
    #[derive(Default)]
    struct RecordingIo {
        loaded: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl DocumentIo for RecordingIo {
        fn load(&self, path: &Path) -> Result<crate::model::Document, crate::errors::DocumentError> {
            self.loaded.lock().unwrap().push(path.to_path_buf());
            JsonDocumentIo.load(path)
        }

        fn save(
            &self,
            document: &crate::model::Document,
            path: &Path,
        ) -> Result<(), crate::errors::DocumentError> {
            JsonDocumentIo.save(document, path)
        }
    }

    #[test]
    fn test_extract_snapshot_removes_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        let good = commit_doc(&store, &sample(), "good");
        std::fs::write(dir.path().join(DOC), "not json").unwrap();
        store.commit("broken").unwrap();

        let io = RecordingIo::default();
        store.extract_snapshot(&good.id.to_string(), &io).unwrap();
        assert!(store.extract_snapshot("HEAD", &io).is_err());

        let loaded = io.loaded.lock().unwrap();
        assert_eq!(loaded.len(), 2);
        for path in loaded.iter() {
            let scratch = path.parent().unwrap();
            assert!(scratch
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("modelmerge-snapshot-"));
            assert!(!scratch.exists(), "{} left behind", scratch.display());
        }
    }

    #[test]
    fn test_modified_paths_ignores_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        commit_doc(&store, &sample(), "initial");
        assert!(store.modified_paths().unwrap().is_empty());

        std::fs::write(dir.path().join("scratch.txt"), "untracked").unwrap();
        let _lock = store.lock("status").unwrap();
        assert!(store.modified_paths().unwrap().is_empty());

        std::fs::write(dir.path().join(DOC), "{}").unwrap();
        assert_eq!(store.modified_paths().unwrap(), vec![DOC.to_string()]);
    }

    #[test]
    fn test_ancestry_and_merge_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = init_store(dir.path());
        let mut doc = sample();
        let base = commit_doc(&store, &doc, "base");
        let main = store.current_branch().unwrap().unwrap();

        store.create_branch("feature", &base).unwrap();
        store.checkout_branch("feature").unwrap();
        doc.node_mut(&"a".into())
            .unwrap()
            .attributes
            .insert("name".into(), Value::text("F"));
        let feature = commit_doc(&store, &doc, "feature edit");

        assert!(store.is_ancestor(&base, &feature).unwrap());
        assert!(!store.is_ancestor(&feature, &base).unwrap());
        assert!(store.is_ancestor(&base, &base).unwrap());

        store.checkout_branch(&main).unwrap();
        doc.node_mut(&"b".into())
            .unwrap()
            .attributes
            .insert("name".into(), Value::text("M"));
        let ours = commit_doc(&store, &doc, "main edit");
        let mb = store.merge_base(&ours, &feature).unwrap().unwrap();
        assert_eq!(mb.id, base.id);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials {
            username: "alice".into(),
            secret: "hunter2".into(),
        };
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }
}
