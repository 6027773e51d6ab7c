//! Processing server registry.

use chrono::{DateTime, Utc};
use ingestd_common::Result;
use rusqlite::{params, Connection};

use super::db_err;
use crate::models::{to_db_time, ProcessingServer};

/// Register a server, or refresh its heartbeat if it is already known.
pub fn ensure_server(conn: &Connection, id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO processing_servers (id, heartbeat) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET heartbeat = excluded.heartbeat",
        params![id, to_db_time(at)],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Touch a server's heartbeat. Returns false if the server row is gone.
pub fn touch_server(conn: &Connection, id: i64, at: DateTime<Utc>) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE processing_servers SET heartbeat = ?1 WHERE id = ?2",
            params![to_db_time(at), id],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Get a server row by id.
pub fn get_server(conn: &Connection, id: i64) -> Result<Option<ProcessingServer>> {
    match conn.query_row(
        "SELECT id, heartbeat FROM processing_servers WHERE id = ?1",
        [id],
        ProcessingServer::from_row,
    ) {
        Ok(s) => Ok(Some(s)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}
