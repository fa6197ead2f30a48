//! End-to-end tests for branch merges of a model document.
//!
//! Every test builds a real git repository in a temp directory, commits the
//! document on two branches and runs the real `MergeEngine` over them.
//! No network I/O and no external binaries.

use std::path::Path;

use tempfile::TempDir;

use modelmerge_core::errors::{MergeError, RepositoryError};
use modelmerge_core::integrity::{validators, IntegrityChecker};
use modelmerge_core::merge::{
    ConflictPolicy, FallbackChoice, FallbackReport, FixedFallback, MergeOutcome, Preference,
};
use modelmerge_core::model::{Document, Embedded, Node, Value};
use modelmerge_core::store::{CommitHandle, MergeStrategy, RevisionStore};
use modelmerge_core::{DocumentIo, JsonDocumentIo, MergeEngine};

// ===========================================================================
// Helpers
// ===========================================================================

const DOC: &str = "model.json";

struct Fixture {
    _dir: TempDir,
    store: RevisionStore,
    main: String,
    base: CommitHandle,
}

/// Repository with one base commit and a `feature` branch pointing at it.
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    git2::Repository::init(dir.path()).unwrap();
    let store = RevisionStore::open(dir.path(), DOC)
        .unwrap()
        .with_committer("Test", "test@test.com");
    let base = commit_doc(&store, &base_doc(), "base");
    let main = store.current_branch().unwrap().expect("branch after first commit");
    store.create_branch("feature", &base).unwrap();
    Fixture {
        _dir: dir,
        store,
        main,
        base,
    }
}

/// model
/// ├── f1 (folder)
/// │   ├── a (element, name="A")
/// │   └── b (element, name="B")
/// └── v1 (view) with embedded bounds, ref -> a
fn base_doc() -> Document {
    let mut doc = Document::new(Node::new("model", "model").with("name", Value::text("M")));
    doc.add_child(&"model".into(), Node::new("f1", "folder"));
    doc.add_child(
        &"f1".into(),
        Node::new("a", "element").with("name", Value::text("A")),
    );
    doc.add_child(
        &"f1".into(),
        Node::new("b", "element").with("name", Value::text("B")),
    );
    doc.add_child(
        &"model".into(),
        Node::new("v1", "view")
            .with("target", Value::Ref("a".into()))
            .with_embedded(
                "bounds",
                Embedded::new("bounds")
                    .with("x", Value::Int(10))
                    .with("y", Value::Int(20)),
            ),
    );
    doc
}

fn commit_doc(store: &RevisionStore, doc: &Document, message: &str) -> CommitHandle {
    JsonDocumentIo
        .save(doc, &store.working_document_path())
        .unwrap();
    store.commit(message).unwrap()
}

fn working_doc(store: &RevisionStore) -> Document {
    JsonDocumentIo.load(&store.working_document_path()).unwrap()
}

/// Edit the document on the checked-out branch and commit it.
fn edit(store: &RevisionStore, message: &str, change: impl FnOnce(&mut Document)) -> CommitHandle {
    let mut doc = working_doc(store);
    change(&mut doc);
    commit_doc(store, &doc, message)
}

/// Commit an edit on `feature`, then return to the main branch.
fn edit_feature(f: &Fixture, message: &str, change: impl FnOnce(&mut Document)) -> CommitHandle {
    f.store.checkout_branch("feature").unwrap();
    let tip = edit(&f.store, message, change);
    f.store.checkout_branch(&f.main).unwrap();
    tip
}

fn set_name(doc: &mut Document, id: &str, value: &str) {
    doc.node_mut(&id.into())
        .unwrap()
        .attributes
        .insert("name".into(), Value::text(value));
}

fn name_of(doc: &Document, id: &str) -> Option<Value> {
    doc.node(&id.into())?.attribute("name").cloned()
}

fn parents_of(dir: &Path, commit: &CommitHandle) -> Vec<git2::Oid> {
    let repo = git2::Repository::open(dir).unwrap();
    let commit = repo.find_commit(commit.id).unwrap();
    commit.parent_ids().collect()
}

fn repo_state_is_clean(dir: &Path) -> bool {
    git2::Repository::open(dir).unwrap().state() == git2::RepositoryState::Clean
}

/// Both sides add a different `legend` node; with a singleton validator the
/// structurally merged document is invalid.
fn diverging_legends(f: &Fixture) -> (CommitHandle, CommitHandle) {
    let theirs = edit_feature(f, "theirs legend", |doc| {
        doc.add_child(&"model".into(), Node::new("l2", "legend"));
    });
    let ours = edit(&f.store, "ours legend", |doc| {
        doc.add_child(&"model".into(), Node::new("l1", "legend"));
    });
    (ours, theirs)
}

fn legend_checker() -> IntegrityChecker {
    IntegrityChecker::new().with("single_legend", validators::required_singleton("legend"))
}

// ===========================================================================
// Fast paths
// ===========================================================================

#[test]
fn test_fast_forward_creates_no_commit() {
    let f = fixture();
    let tip = edit_feature(&f, "rename b", |doc| set_name(doc, "b", "Beta"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();

    match outcome {
        MergeOutcome::FastForwarded { to } => assert_eq!(to.id, tip.id),
        other => panic!("expected FastForwarded, got {}", other),
    }
    assert_eq!(f.store.head().unwrap().id, tip.id);
    assert_eq!(name_of(&working_doc(&f.store), "b"), Some(Value::text("Beta")));
    assert_eq!(f.store.current_branch().unwrap().as_deref(), Some(f.main.as_str()));
}

#[test]
fn test_already_up_to_date() {
    let f = fixture();
    let head = edit(&f.store, "rename a", |doc| set_name(doc, "a", "Alpha"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::AlreadyUpToDate));
    assert_eq!(f.store.head().unwrap().id, head.id);
    assert_ne!(head.id, f.base.id);
}

// ===========================================================================
// Three-way merges
// ===========================================================================

#[test]
fn test_disjoint_changes_merge_without_conflicts() {
    let f = fixture();
    let theirs = edit_feature(&f, "rename b", |doc| set_name(doc, "b", "Beta"));
    let ours = edit(&f.store, "move view", |doc| {
        doc.node_mut(&"v1".into())
            .unwrap()
            .embedded
            .get_mut("bounds")
            .unwrap()
            .attributes
            .insert("x".into(), Value::Int(99));
    });

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();

    let (commit, report) = match outcome {
        MergeOutcome::Merged { commit, report } => (commit, report),
        other => panic!("expected Merged, got {}", other),
    };
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.differences, 2);
    assert!(report.violations.is_empty());

    let merged = working_doc(&f.store);
    assert_eq!(name_of(&merged, "b"), Some(Value::text("Beta")));
    assert_eq!(
        merged.embedded(&"v1".into(), "bounds").unwrap().attributes.get("x"),
        Some(&Value::Int(99))
    );

    assert_eq!(f.store.head().unwrap().id, commit.id);
    assert_eq!(parents_of(f.store.repo_path(), &commit), vec![ours.id, theirs.id]);
    assert_eq!(commit.message, format!("Merge branch 'feature' into {}", f.main));
    assert!(repo_state_is_clean(f.store.repo_path()));

    // The merged document is what the commit holds.
    let snapshot = f.store.extract_snapshot("HEAD", &JsonDocumentIo).unwrap();
    assert!(snapshot.document().structurally_eq(&merged));
}

#[test]
fn test_same_attribute_conflict_keeps_ours_by_default() {
    let f = fixture();
    edit_feature(&f, "name B", |doc| set_name(doc, "a", "B"));
    edit(&f.store, "name C", |doc| set_name(doc, "a", "C"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();

    let report = match outcome {
        MergeOutcome::Merged { report, .. } => report,
        other => panic!("expected Merged, got {}", other),
    };
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.resolved_ours, 1);
    assert_eq!(report.resolved_theirs, 0);
    assert_eq!(name_of(&working_doc(&f.store), "a"), Some(Value::text("C")));
}

#[test]
fn test_same_attribute_conflict_follows_configured_policy() {
    let f = fixture();
    edit_feature(&f, "name B", |doc| set_name(doc, "a", "B"));
    edit(&f.store, "name C", |doc| set_name(doc, "a", "C"));

    let policy = ConflictPolicy {
        attribute: Preference::Theirs,
        containment: Preference::Theirs,
    };
    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_policy(policy)
        .merge("feature")
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Merged { .. }));
    assert_eq!(name_of(&working_doc(&f.store), "a"), Some(Value::text("B")));
}

#[test]
fn test_missing_attachment_is_repaired_from_theirs() {
    let f = fixture();
    edit_feature(&f, "add icon", |doc| {
        JsonDocumentIo.add_attachment(doc, "img/a.png", vec![1, 2, 3]);
        doc.node_mut(&"a".into())
            .unwrap()
            .attributes
            .insert("icon".into(), Value::Attachment("img/a.png".into()));
    });
    edit(&f.store, "rename b", |doc| set_name(doc, "b", "Beta"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();

    let report = match outcome {
        MergeOutcome::Merged { report, .. } => report,
        other => panic!("expected Merged, got {}", other),
    };
    assert_eq!(report.attachments_repaired, 1);
    let merged = working_doc(&f.store);
    assert_eq!(
        JsonDocumentIo.attachment_bytes(&merged, "img/a.png"),
        Some(&[1u8, 2, 3][..])
    );
    assert_eq!(name_of(&merged, "b"), Some(Value::text("Beta")));
}

// ===========================================================================
// Conflict fallback
// ===========================================================================

#[test]
fn test_cancel_restores_head_and_working_tree() {
    let f = fixture();
    let (ours, _) = diverging_legends(&f);
    let before = std::fs::read(f.store.working_document_path()).unwrap();

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_checker(legend_checker())
        .with_fallback(FixedFallback(FallbackChoice::Cancel))
        .merge("feature")
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Cancelled));
    assert_eq!(f.store.head().unwrap().id, ours.id);
    assert_eq!(std::fs::read(f.store.working_document_path()).unwrap(), before);
    assert!(repo_state_is_clean(f.store.repo_path()));
    // The lock was released.
    f.store.lock("after").unwrap().release().unwrap();
}

#[test]
fn test_cancel_removes_files_brought_in_by_theirs() {
    let f = fixture();
    let added = f.store.repo_path().join("theirs-only.txt");
    f.store.checkout_branch("feature").unwrap();
    std::fs::write(&added, "from feature\n").unwrap();
    edit(&f.store, "theirs legend and file", |doc| {
        doc.add_child(&"model".into(), Node::new("l2", "legend"));
    });
    f.store.checkout_branch(&f.main).unwrap();
    assert!(!added.exists());
    let ours = edit(&f.store, "ours legend", |doc| {
        doc.add_child(&"model".into(), Node::new("l1", "legend"));
    });

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_checker(legend_checker())
        .with_fallback(FixedFallback(FallbackChoice::Cancel))
        .merge("feature")
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Cancelled));
    assert_eq!(f.store.head().unwrap().id, ours.id);
    assert!(!added.exists());
    assert!(f.store.modified_paths().unwrap().is_empty());
    assert!(repo_state_is_clean(f.store.repo_path()));
}

#[test]
fn test_integrity_failure_takes_theirs_wholesale() {
    let f = fixture();
    let (ours, theirs) = diverging_legends(&f);
    let theirs_bytes = {
        f.store.checkout_branch("feature").unwrap();
        let bytes = std::fs::read(f.store.working_document_path()).unwrap();
        f.store.checkout_branch(&f.main).unwrap();
        bytes
    };

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_checker(legend_checker())
        .with_fallback(FixedFallback(FallbackChoice::TakeTheirs))
        .merge("feature")
        .unwrap();

    let (side, commit, report) = match outcome {
        MergeOutcome::MergedWithConflictsResolved {
            side,
            commit,
            report,
        } => (side, commit, report),
        other => panic!("expected MergedWithConflictsResolved, got {}", other),
    };
    assert_eq!(side, Preference::Theirs);
    assert_eq!(report.violations.len(), 2);
    assert!(report
        .violations
        .iter()
        .all(|v| v.rule == "single_legend"));
    assert_eq!(
        std::fs::read(f.store.working_document_path()).unwrap(),
        theirs_bytes
    );
    assert_eq!(parents_of(f.store.repo_path(), &commit), vec![ours.id, theirs.id]);
    assert!(repo_state_is_clean(f.store.repo_path()));
}

#[test]
fn test_resolver_sees_violations_and_can_take_ours() {
    let f = fixture();
    let (ours, _) = diverging_legends(&f);
    let ours_doc = working_doc(&f.store);

    let resolver = |report: &FallbackReport| {
        assert_eq!(report.branch, "feature");
        assert!(!report.violations.is_empty());
        assert!(report.conflicted_paths.is_empty());
        FallbackChoice::TakeOurs
    };
    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_checker(legend_checker())
        .with_fallback(resolver)
        .merge("feature")
        .unwrap();

    match outcome {
        MergeOutcome::MergedWithConflictsResolved { side, commit, .. } => {
            assert_eq!(side, Preference::Ours);
            assert_eq!(parents_of(f.store.repo_path(), &commit)[0], ours.id);
        }
        other => panic!("expected MergedWithConflictsResolved, got {}", other),
    }
    assert!(working_doc(&f.store).structurally_eq(&ours_doc));
}

#[test]
fn test_conflicted_side_file_goes_to_fallback() {
    let f = fixture();
    let notes = f.store.repo_path().join("notes.txt");

    f.store.checkout_branch("feature").unwrap();
    std::fs::write(&notes, "theirs\n").unwrap();
    edit(&f.store, "theirs notes", |doc| set_name(doc, "b", "Beta"));
    f.store.checkout_branch(&f.main).unwrap();
    std::fs::write(&notes, "ours\n").unwrap();
    edit(&f.store, "ours notes", |doc| set_name(doc, "a", "Alpha"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_fallback(FixedFallback(FallbackChoice::TakeOurs))
        .merge("feature")
        .unwrap();

    let report = match outcome {
        MergeOutcome::MergedWithConflictsResolved { report, .. } => report,
        other => panic!("expected MergedWithConflictsResolved, got {}", other),
    };
    assert_eq!(report.conflicted_paths, vec!["notes.txt".to_string()]);
    assert!(report.violations.is_empty());
    assert_eq!(std::fs::read_to_string(&notes).unwrap(), "ours\n");
}

#[test]
fn test_file_favor_theirs_resolves_side_file() {
    let f = fixture();
    let notes = f.store.repo_path().join("notes.txt");

    f.store.checkout_branch("feature").unwrap();
    std::fs::write(&notes, "theirs\n").unwrap();
    edit(&f.store, "theirs notes", |doc| set_name(doc, "b", "Beta"));
    f.store.checkout_branch(&f.main).unwrap();
    std::fs::write(&notes, "ours\n").unwrap();
    edit(&f.store, "ours notes", |doc| set_name(doc, "a", "Alpha"));

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_strategy(MergeStrategy::Theirs)
        .merge("feature")
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Merged { .. }));
    assert_eq!(std::fs::read_to_string(&notes).unwrap(), "theirs\n");
    let merged = working_doc(&f.store);
    assert_eq!(name_of(&merged, "a"), Some(Value::text("Alpha")));
    assert_eq!(name_of(&merged, "b"), Some(Value::text("Beta")));
}

// ===========================================================================
// Preconditions
// ===========================================================================

#[test]
fn test_held_lock_makes_repository_unavailable() {
    let f = fixture();
    edit_feature(&f, "rename b", |doc| set_name(doc, "b", "Beta"));
    let head = edit(&f.store, "rename a", |doc| set_name(doc, "a", "Alpha"));

    let held = f.store.lock("other merge").unwrap();
    let result = MergeEngine::new(&f.store, &JsonDocumentIo).merge("feature");
    assert!(matches!(
        result,
        Err(MergeError::Repository(
            RepositoryError::RepositoryUnavailable { .. }
        ))
    ));
    assert_eq!(f.store.head().unwrap().id, head.id);
    held.release().unwrap();

    let outcome = MergeEngine::new(&f.store, &JsonDocumentIo)
        .merge("feature")
        .unwrap();
    assert!(matches!(outcome, MergeOutcome::Merged { .. }));
}

#[test]
fn test_uncommitted_document_edit_blocks_fast_forward() {
    let f = fixture();
    edit_feature(&f, "rename b", |doc| set_name(doc, "b", "Beta"));
    let mut unsaved = working_doc(&f.store);
    set_name(&mut unsaved, "a", "UNSAVED");
    JsonDocumentIo
        .save(&unsaved, &f.store.working_document_path())
        .unwrap();

    let result = MergeEngine::new(&f.store, &JsonDocumentIo).merge("feature");
    match result {
        Err(MergeError::DirtyWorkingTree { paths }) => assert_eq!(paths, vec![DOC.to_string()]),
        other => panic!("expected DirtyWorkingTree, got {:?}", other.map(|o| o.to_string())),
    }
    assert_eq!(f.store.head().unwrap().id, f.base.id);
    let doc = working_doc(&f.store);
    assert_eq!(name_of(&doc, "a"), Some(Value::text("UNSAVED")));
    assert_eq!(name_of(&doc, "b"), Some(Value::text("B")));
    f.store.lock("after").unwrap().release().unwrap();
}

#[test]
fn test_uncommitted_side_file_survives_refused_merge() {
    let f = fixture();
    let notes = f.store.repo_path().join("notes.txt");
    std::fs::write(&notes, "tracked\n").unwrap();
    f.store.commit("track notes").unwrap();
    let (ours, _) = diverging_legends(&f);
    std::fs::write(&notes, "local edit\n").unwrap();

    let result = MergeEngine::new(&f.store, &JsonDocumentIo)
        .with_checker(legend_checker())
        .with_fallback(FixedFallback(FallbackChoice::Cancel))
        .merge("feature");

    assert!(matches!(
        result,
        Err(MergeError::DirtyWorkingTree { ref paths }) if paths == &["notes.txt".to_string()]
    ));
    assert_eq!(f.store.head().unwrap().id, ours.id);
    assert_eq!(std::fs::read_to_string(&notes).unwrap(), "local edit\n");
    assert!(repo_state_is_clean(f.store.repo_path()));
}

#[test]
fn test_unknown_branch_is_not_found() {
    let f = fixture();
    let result = MergeEngine::new(&f.store, &JsonDocumentIo).merge("no-such-branch");
    assert!(matches!(
        result,
        Err(MergeError::Repository(RepositoryError::NotFound(_)))
    ));
}

#[test]
fn test_unrelated_histories_are_rejected() {
    let f = fixture();
    {
        let repo = git2::Repository::open(f.store.repo_path()).unwrap();
        let sig = git2::Signature::now("Test", "test@test.com").unwrap();
        let tree = repo.head().unwrap().peel_to_tree().unwrap();
        repo.commit(Some("refs/heads/orphan"), &sig, &sig, "orphan", &tree, &[])
            .unwrap();
    }

    let result = MergeEngine::new(&f.store, &JsonDocumentIo).merge("orphan");
    assert!(matches!(result, Err(MergeError::UnrelatedHistories { .. })));
    assert_eq!(f.store.head().unwrap().id, f.base.id);
    f.store.lock("after").unwrap().release().unwrap();
}

#[test]
fn test_detached_head_is_rejected() {
    let f = fixture();
    edit_feature(&f, "rename b", |doc| set_name(doc, "b", "Beta"));
    let ours = edit(&f.store, "rename a", |doc| set_name(doc, "a", "Alpha"));
    git2::Repository::open(f.store.repo_path())
        .unwrap()
        .set_head_detached(ours.id)
        .unwrap();

    let result = MergeEngine::new(&f.store, &JsonDocumentIo).merge("feature");
    assert!(matches!(result, Err(MergeError::DetachedHead)));
    assert_eq!(f.store.head().unwrap().id, ours.id);
}
