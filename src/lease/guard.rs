//! Catalog writes that depend on holding a lease.
//!
//! The local registry says who holds a lease, but the renewal daemon can
//! revoke it at any moment. Every write that relies on exclusivity therefore
//! takes a fresh write lock on the catalog, confirms the row still exists,
//! confirms the caller's token still holds the lease, and only then writes.

use ingestd_common::{ArtifactId, OwnerToken, Result};
use ingestd_db::queries::{artifacts, db_err};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::LeaseManager;

/// What the guarded body wants done with its transaction.
#[derive(Debug)]
pub enum Decision<T> {
    Commit(T),
    Rollback(T),
}

/// Result of a guarded write.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The body ran and its writes were committed.
    Committed(T),
    /// The body ran and asked for its writes to be discarded.
    RolledBack(T),
    /// The artifact row no longer exists; nothing ran.
    Missing,
    /// The caller no longer holds the lease; nothing ran.
    LeaseLost,
}

/// Run `body` inside an immediate transaction on `conn`, only while `owner`
/// holds the lease on `id`.
///
/// An error from `body` rolls the transaction back and is returned as-is.
pub fn under_lease<T>(
    conn: &Connection,
    leases: &LeaseManager,
    id: ArtifactId,
    owner: OwnerToken,
    body: impl FnOnce(&Connection) -> Result<Decision<T>>,
) -> Result<Guarded<T>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate).map_err(db_err)?;

    if artifacts::artifact_heartbeat(&tx, id)?.is_none() {
        return Ok(Guarded::Missing);
    }
    if !leases.is_held_by(id, owner) {
        tracing::warn!(artifact_id = %id, "Lease lost before a guarded write");
        return Ok(Guarded::LeaseLost);
    }

    match body(&*tx)? {
        Decision::Commit(value) => {
            tx.commit().map_err(db_err)?;
            Ok(Guarded::Committed(value))
        }
        Decision::Rollback(value) => {
            tx.rollback().map_err(db_err)?;
            Ok(Guarded::RolledBack(value))
        }
    }
}
