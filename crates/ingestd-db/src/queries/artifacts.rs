//! Artifact catalog operations.
//!
//! Liveness filters take a `live_after` instant: a row whose heartbeat is at
//! or after it belongs to some server's lease and is left alone by every
//! scan. Rows flagged `ready_for_delete` are only touched by the deletion
//! path.

use chrono::{DateTime, Utc};
use ingestd_common::{ArtifactId, ArtifactTypeId, ProcessState, Result};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection};

use super::db_err;
use crate::models::{to_db_time, Artifact, NewArtifact};

const COLS: &str = "id, name, size, type_id, source_artifact_id, process_state, msg,
    process_percentage, ready_for_processing, ready_for_delete, in_use,
    has_processed_successfully, reprocess, session_id, heartbeat,
    process_start_time, process_end_time, created_at, updated_at";

const NOT_LIVE: &str = "(heartbeat IS NULL OR heartbeat < ?1)";

fn now() -> String {
    to_db_time(Utc::now())
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run a scan that filters on liveness and artifact type.
///
/// `?1` is bound to `live_after`; the type ids fill `{types}`.
fn scan(
    conn: &Connection,
    sql: &str,
    live_after: DateTime<Utc>,
    types: &[ArtifactTypeId],
) -> Result<Vec<Artifact>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }

    let q = sql.replace("{types}", &placeholders(2, types.len()));
    let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(to_db_time(live_after))];
    params_vec.extend(types.iter().map(|t| Box::new(t.get()) as Box<dyn ToSql>));
    let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), Artifact::from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// rows
// ---------------------------------------------------------------------------

/// Insert an artifact row and return it with its catalog-assigned id.
pub fn insert_artifact(conn: &Connection, new: &NewArtifact) -> Result<Artifact> {
    let now = now();
    let q = format!(
        "INSERT INTO artifacts (name, size, type_id, source_artifact_id, process_state,
            ready_for_processing, ready_for_delete, in_use, session_id, heartbeat,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         RETURNING {COLS}"
    );
    conn.query_row(
        &q,
        params![
            new.name,
            new.size,
            new.type_id,
            new.source_artifact_id.map(i64::from),
            new.process_state.unwrap_or(ProcessState::Pending).as_i64(),
            new.ready_for_processing,
            new.ready_for_delete,
            new.in_use,
            new.session_id,
            new.heartbeat.map(to_db_time),
            now,
        ],
        Artifact::from_row,
    )
    .map_err(db_err)
}

/// Get an artifact by id.
pub fn get_artifact(conn: &Connection, id: ArtifactId) -> Result<Option<Artifact>> {
    let q = format!("SELECT {COLS} FROM artifacts WHERE id = ?1");
    match conn.query_row(&q, [id.get()], Artifact::from_row) {
        Ok(a) => Ok(Some(a)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

/// Read an artifact's heartbeat.
///
/// The outer `Option` is `None` when the row does not exist; the inner one
/// when the row has never been leased.
pub fn artifact_heartbeat(
    conn: &Connection,
    id: ArtifactId,
) -> Result<Option<Option<DateTime<Utc>>>> {
    let raw = conn.query_row(
        "SELECT heartbeat FROM artifacts WHERE id = ?1",
        [id.get()],
        |row| row.get::<_, Option<String>>(0),
    );
    match raw {
        Ok(None) => Ok(Some(None)),
        Ok(Some(s)) => crate::models::from_db_time(&s)
            .map(|at| Some(Some(at)))
            .map_err(|e| ingestd_common::Error::database(format!("bad heartbeat on {id}: {e}"))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

/// Overwrite an artifact's heartbeat. Returns the number of rows written.
pub fn write_heartbeat(conn: &Connection, id: ArtifactId, at: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "UPDATE artifacts SET heartbeat = ?1 WHERE id = ?2",
        params![to_db_time(at), id.get()],
    )
    .map_err(db_err)
}

// ---------------------------------------------------------------------------
// scans
// ---------------------------------------------------------------------------

/// Move every successful artifact with a pending reprocess request into
/// cleanup. Needs no lease: it only records intent.
pub fn promote_reprocess_requests(conn: &Connection) -> Result<usize> {
    conn.execute(
        "UPDATE artifacts SET process_state = ?1, reprocess = 0, updated_at = ?2
         WHERE reprocess = 1 AND process_state = ?3 AND ready_for_delete = 0",
        params![
            ProcessState::AwaitingReprocessCleanup.as_i64(),
            now(),
            ProcessState::Success.as_i64()
        ],
    )
    .map_err(db_err)
}

/// Artifacts waiting for their derived children to be removed.
pub fn list_awaiting_reprocess_cleanup(
    conn: &Connection,
    live_after: DateTime<Utc>,
    types: &[ArtifactTypeId],
) -> Result<Vec<Artifact>> {
    let sql = format!(
        "SELECT {COLS} FROM artifacts
         WHERE process_state = {state} AND ready_for_delete = 0
           AND {NOT_LIVE} AND type_id IN ({{types}})
         ORDER BY id",
        state = ProcessState::AwaitingReprocessCleanup.as_i64()
    );
    scan(conn, &sql, live_after, types)
}

/// Root artifacts to be deleted: flagged for deletion, or abandoned (never
/// put in use and no upload session attached).
pub fn list_delete_candidates(
    conn: &Connection,
    live_after: DateTime<Utc>,
    types: &[ArtifactTypeId],
) -> Result<Vec<Artifact>> {
    let sql = format!(
        "SELECT {COLS} FROM artifacts
         WHERE source_artifact_id IS NULL
           AND (ready_for_delete = 1 OR (in_use = 0 AND session_id IS NULL))
           AND {NOT_LIVE} AND type_id IN ({{types}})
         ORDER BY id"
    );
    scan(conn, &sql, live_after, types)
}

/// Artifacts ready to be processed, most recently updated first.
pub fn list_process_candidates(
    conn: &Connection,
    live_after: DateTime<Utc>,
    types: &[ArtifactTypeId],
) -> Result<Vec<Artifact>> {
    let sql = format!(
        "SELECT {COLS} FROM artifacts
         WHERE ready_for_processing = 1 AND process_state = {pending}
           AND ready_for_delete = 0
           AND (session_id IS NOT NULL OR in_use = 1)
           AND {NOT_LIVE} AND type_id IN ({{types}})
         ORDER BY updated_at DESC, id DESC",
        pending = ProcessState::Pending.as_i64()
    );
    scan(conn, &sql, live_after, types)
}

// ---------------------------------------------------------------------------
// deletion
// ---------------------------------------------------------------------------

/// Children of `parent` that no server currently holds.
pub fn list_removable_children(
    conn: &Connection,
    parent: ArtifactId,
    live_after: DateTime<Utc>,
) -> Result<Vec<Artifact>> {
    let q = format!(
        "SELECT {COLS} FROM artifacts
         WHERE source_artifact_id = ?2 AND {NOT_LIVE}
         ORDER BY id"
    );
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map(params![to_db_time(live_after), parent.get()], Artifact::from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Number of rows, live or not, derived from `parent`.
pub fn count_children(conn: &Connection, parent: ArtifactId) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM artifacts WHERE source_artifact_id = ?1",
        [parent.get()],
        |row| row.get(0),
    )
    .map_err(db_err)
}

/// Set the sticky `ready_for_delete` flag. Returns the number of rows that
/// changed, so a second call on the same row returns 0.
pub fn mark_ready_for_delete(conn: &Connection, id: ArtifactId) -> Result<usize> {
    conn.execute(
        "UPDATE artifacts SET ready_for_delete = 1, updated_at = ?1
         WHERE id = ?2 AND ready_for_delete = 0",
        params![now(), id.get()],
    )
    .map_err(db_err)
}

/// Delete an artifact row. Returns the number of rows deleted.
pub fn delete_artifact_row(conn: &Connection, id: ArtifactId) -> Result<usize> {
    conn.execute("DELETE FROM artifacts WHERE id = ?1", [id.get()])
        .map_err(db_err)
}

// ---------------------------------------------------------------------------
// processing state
// ---------------------------------------------------------------------------

/// Move an artifact from one state to another, only if it is still in the
/// expected state. Returns whether the row changed.
pub fn set_process_state_if(
    conn: &Connection,
    id: ArtifactId,
    from: ProcessState,
    to: ProcessState,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE artifacts SET process_state = ?1, updated_at = ?2
             WHERE id = ?3 AND process_state = ?4",
            params![to.as_i64(), now(), id.get(), from.as_i64()],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Write the status message and optional percentage.
pub fn update_status(
    conn: &Connection,
    id: ArtifactId,
    msg: &str,
    percentage: Option<i32>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE artifacts SET msg = ?1, process_percentage = ?2, updated_at = ?3
             WHERE id = ?4",
            params![msg, percentage.map(|p| p.clamp(0, 100)), now(), id.get()],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Record when a processing attempt started.
pub fn mark_process_start(conn: &Connection, id: ArtifactId, at: DateTime<Utc>) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE artifacts SET process_start_time = ?1, process_end_time = NULL
             WHERE id = ?2",
            params![to_db_time(at), id.get()],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Record when a processing attempt ended.
pub fn mark_process_end(conn: &Connection, id: ArtifactId, at: DateTime<Utc>) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE artifacts SET process_end_time = ?1 WHERE id = ?2",
            params![to_db_time(at), id.get()],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// finalization
// ---------------------------------------------------------------------------

/// Put derived artifacts in use. Sets `process_state` to success in the
/// same statement. Returns how many rows were marked; callers compare it to
/// `ids.len()`.
pub fn mark_in_use(conn: &Connection, ids: &[ArtifactId]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let q = format!(
        "UPDATE artifacts SET in_use = 1, process_state = ?1, updated_at = ?2
         WHERE id IN ({})",
        placeholders(3, ids.len())
    );
    let mut params_vec: Vec<Box<dyn ToSql>> = vec![
        Box::new(ProcessState::Success.as_i64()),
        Box::new(now()),
    ];
    params_vec.extend(ids.iter().map(|id| Box::new(id.get()) as Box<dyn ToSql>));
    let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();

    conn.execute(&q, params_refs.as_slice()).map_err(db_err)
}

/// Write the outcome of a processing attempt. Success also sets the
/// sticky `has_processed_successfully` flag. Returns the number of rows
/// written.
pub fn record_outcome(conn: &Connection, id: ArtifactId, success: bool, msg: &str) -> Result<usize> {
    let state = if success {
        ProcessState::Success
    } else {
        ProcessState::Failed
    };
    conn.execute(
        "UPDATE artifacts
         SET process_state = ?1, msg = ?2, process_percentage = NULL,
             has_processed_successfully = CASE WHEN ?3 THEN 1 ELSE has_processed_successfully END,
             updated_at = ?4
         WHERE id = ?5",
        params![state.as_i64(), msg, success, now(), id.get()],
    )
    .map_err(db_err)
}

/// Whether the artifact has ever been processed successfully.
pub fn has_processed_successfully(conn: &Connection, id: ArtifactId) -> Result<Option<bool>> {
    match conn.query_row(
        "SELECT has_processed_successfully FROM artifacts WHERE id = ?1",
        [id.get()],
        |row| row.get::<_, bool>(0),
    ) {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}
