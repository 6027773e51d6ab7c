//! Catalog query operations.
//!
//! Queries are free functions over a `rusqlite::Connection`, so the same
//! function works on a pooled connection or inside a transaction.

pub mod artifacts;
pub mod servers;

use ingestd_common::Error;
use rusqlite::ErrorCode;

/// Map a rusqlite error into the common error type.
///
/// Lock contention (`SQLITE_BUSY`, `SQLITE_LOCKED`) becomes
/// [`Error::WriteConflict`] so callers can tell it apart from a broken
/// query or a lost connection.
pub fn db_err(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            Error::write_conflict(e.to_string())
        }
        _ => Error::database(e.to_string()),
    }
}
