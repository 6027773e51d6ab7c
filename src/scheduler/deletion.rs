//! Recursive removal of artifacts and their derived children.
//!
//! Children go first, bytes and row, so a crash part way never leaves a
//! child pointing at a parent that no longer exists. The parent is marked
//! `ready_for_delete` before anything is removed and the flag is never
//! cleared, so readers treat a half-deleted tree as gone and the next tick
//! finishes the job.

use chrono::Utc;
use ingestd_common::{OwnerToken, Result};
use ingestd_db::models::Artifact;
use ingestd_db::queries::artifacts;
use rusqlite::Connection;

use crate::context::AppContext;
use crate::lease::{under_lease, Decision, Guarded};

/// Remove the children of `artifact`, and the artifact itself when
/// `remove_self` is set.
///
/// Returns `Ok(true)` only when everything asked for is gone. A busy lease
/// or a child that could not be removed yields `Ok(false)`; the caller
/// retries on a later tick. The lease taken here is released before
/// returning, errors included.
pub fn remove_recursive(
    ctx: &AppContext,
    conn: &Connection,
    artifact: &Artifact,
    remove_self: bool,
    owner: OwnerToken,
) -> Result<bool> {
    let id = artifact.id;
    if !ctx.leases.acquire(id, owner, false)? {
        tracing::debug!(artifact_id = %id, "Artifact busy, deferring removal");
        return Ok(false);
    }

    let result = remove_leased(ctx, conn, artifact, remove_self, owner);
    let released = ctx.leases.release(id, owner);
    let removed = result?;
    released?;
    Ok(removed)
}

fn remove_leased(
    ctx: &AppContext,
    conn: &Connection,
    artifact: &Artifact,
    remove_self: bool,
    owner: OwnerToken,
) -> Result<bool> {
    let id = artifact.id;
    let leases = &ctx.leases;

    if remove_self {
        let marked = under_lease(conn, leases, id, owner, |tx| {
            Ok(Decision::Commit(artifacts::mark_ready_for_delete(tx, id)?))
        })?;
        match marked {
            Guarded::Committed(1) => tracing::info!(artifact_id = %id, "Marked for deletion"),
            Guarded::Committed(_) | Guarded::RolledBack(_) => {}
            Guarded::Missing | Guarded::LeaseLost => return Ok(false),
        }
    }

    let live_after = leases.timing().live_after(Utc::now());
    let mut children_removed = true;
    for child in artifacts::list_removable_children(conn, id, live_after)? {
        if !remove_recursive(ctx, conn, &child, true, owner)? {
            tracing::debug!(artifact_id = %id, child_id = %child.id, "Child not removed");
            children_removed = false;
        }
    }
    if !children_removed {
        return Ok(false);
    }

    let remaining = artifacts::count_children(conn, id)?;
    if remaining > 0 {
        tracing::debug!(artifact_id = %id, remaining, "Live children remain");
        return Ok(false);
    }

    if !remove_self {
        return Ok(true);
    }

    if !leases.is_held_by(id, owner) {
        tracing::warn!(artifact_id = %id, "Lease lost before removing bytes");
        return Ok(false);
    }
    if ctx.storage.remove_artifact_bytes(id)? {
        tracing::debug!(artifact_id = %id, "Removed artifact bytes");
    }

    let deleted = under_lease(conn, leases, id, owner, |tx| {
        Ok(Decision::Commit(artifacts::delete_artifact_row(tx, id)?))
    })?;
    match deleted {
        Guarded::Committed(1) => {
            tracing::info!(artifact_id = %id, "Artifact deleted");
            Ok(true)
        }
        _ => Ok(false),
    }
}
