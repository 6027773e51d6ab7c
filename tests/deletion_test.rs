//! Delete-scan integration tests.
//!
//! A trigger logs every row deletion so the tests can check that a tree is
//! removed leaves first.

mod common;

use common::{FnProcessor, TestHarness};
use ingestd_common::{ArtifactId, OwnerToken};

fn harness() -> TestHarness {
    let harness = TestHarness::new(FnProcessor::new(|ctx| Ok(ctx.succeed("Processed."))));
    harness
        .conn()
        .execute_batch(
            "CREATE TABLE deletion_log (seq INTEGER PRIMARY KEY AUTOINCREMENT, artifact_id INTEGER NOT NULL);
             CREATE TRIGGER log_artifact_delete AFTER DELETE ON artifacts
             BEGIN
                 INSERT INTO deletion_log (artifact_id) VALUES (OLD.id);
             END;",
        )
        .unwrap();
    harness
}

fn deletion_order(harness: &TestHarness) -> Vec<i64> {
    let conn = harness.conn();
    let mut stmt = conn
        .prepare("SELECT artifact_id FROM deletion_log ORDER BY seq")
        .unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<i64>, _>>()
        .unwrap()
}

/// root -> child -> grandchild, root flagged for deletion.
fn tree(harness: &TestHarness) -> (ArtifactId, ArtifactId, ArtifactId) {
    let root = harness.upload(b"root");
    let child = harness.derived(root.id, b"child");
    let grandchild = harness.derived(child.id, b"grandchild");
    harness.exec("UPDATE artifacts SET ready_for_delete = 1 WHERE id = ?1", root.id);
    harness.expire_heartbeat(root.id);
    (root.id, child.id, grandchild.id)
}

#[tokio::test(flavor = "multi_thread")]
async fn tree_is_deleted_leaves_first() {
    let harness = harness();
    let (root, child, grandchild) = tree(&harness);

    let report = harness.tick_and_drain().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.dispatched, 0);

    assert_eq!(deletion_order(&harness), vec![grandchild.get(), child.get(), root.get()]);
    for id in [root, child, grandchild] {
        assert!(!harness.exists(id));
        assert!(!harness.files_path(id).exists());
    }
    assert_eq!(harness.leases.held_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_grandchild_keeps_the_tree_and_marks_it() {
    let harness = harness();
    let (root, child, grandchild) = tree(&harness);

    // Another local owner holds the grandchild.
    let other = OwnerToken::new();
    assert!(harness.leases.acquire(grandchild, other, true).unwrap());

    let report = harness.tick_and_drain().await;
    assert_eq!(report.deleted, 0);
    assert!(deletion_order(&harness).is_empty());

    let root_row = harness.get(root);
    assert!(root_row.ready_for_delete, "deletion intent must be visible");
    assert!(harness.files_path(root).exists());
    assert!(harness.exists(child));
    assert!(harness.exists(grandchild));

    // Once the grandchild is free again the next tick finishes the job.
    harness.leases.release(grandchild, other).unwrap();
    harness.expire_heartbeat(grandchild);
    harness.expire_heartbeat(child);
    harness.expire_heartbeat(root);

    let report = harness.tick_and_drain().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(deletion_order(&harness), vec![grandchild.get(), child.get(), root.get()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_child_blocks_parent_removal() {
    let harness = harness();
    let (root, child, grandchild) = tree(&harness);
    harness.set_heartbeat(child, chrono::Utc::now());

    harness.tick_and_drain().await;

    assert!(deletion_order(&harness).is_empty());
    assert!(harness.exists(root));
    assert!(harness.exists(child));
    assert!(harness.exists(grandchild));
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_bytes_count_as_deleted() {
    let harness = harness();
    let root = harness.upload(b"root");
    std::fs::remove_file(harness.files_path(root.id)).unwrap();

    let pending = harness.upload(b"pending");
    std::fs::rename(harness.files_path(pending.id), harness.ctx.storage.pending_path(pending.id)).unwrap();

    for id in [root.id, pending.id] {
        harness.exec("UPDATE artifacts SET ready_for_delete = 1 WHERE id = ?1", id);
    }

    let report = harness.tick_and_drain().await;
    assert_eq!(report.deleted, 2);
    assert!(!harness.exists(root.id));
    assert!(!harness.exists(pending.id));
    assert!(!harness.ctx.storage.pending_path(pending.id).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_uploads_are_deleted_but_sessions_are_kept() {
    let harness = harness();
    let abandoned = harness.upload(b"abandoned");
    harness.exec("UPDATE artifacts SET in_use = 0, ready_for_processing = 0 WHERE id = ?1", abandoned.id);
    let in_session = harness.upload(b"uploading");
    harness.exec(
        "UPDATE artifacts SET in_use = 0, ready_for_processing = 0, session_id = 'upload-1' WHERE id = ?1",
        in_session.id,
    );

    let report = harness.tick_and_drain().await;

    assert_eq!(report.deleted, 1);
    assert!(!harness.exists(abandoned.id));
    assert!(harness.exists(in_session.id));
}
