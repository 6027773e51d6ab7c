//! Row-lock access to artifact heartbeats.
//!
//! The lease manager only needs one primitive from the catalog: lock an
//! artifact row, read its heartbeat, optionally write a new one, then
//! commit or roll back. [`LeaseStore`] is that primitive. The SQLite
//! implementation takes the database write lock with `BEGIN IMMEDIATE`,
//! which queues competing lockers the same way an exclusive row lock does.

use chrono::{DateTime, Utc};
use ingestd_common::{ArtifactId, Result};
use ingestd_db::pool::{get_conn, DbPool, PooledConnection};
use ingestd_db::queries::{artifacts, db_err};

/// An exclusive lock on one artifact row, held until commit or rollback.
pub trait HeartbeatLock {
    /// The heartbeat read when the lock was taken. `None` if the row has
    /// never been leased.
    fn heartbeat(&self) -> Option<DateTime<Utc>>;

    /// Overwrite the heartbeat. Returns the number of rows written.
    fn write_heartbeat(&mut self, at: DateTime<Utc>) -> Result<usize>;

    /// Make the write visible and release the lock.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Discard any write and release the lock.
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Source of artifact row locks.
pub trait LeaseStore: Send + Sync {
    /// Lock an artifact row and read its heartbeat. Blocks while another
    /// holder has the lock. Returns `None` if the row does not exist.
    fn lock(&self, id: ArtifactId) -> Result<Option<Box<dyn HeartbeatLock + '_>>>;
}

/// [`LeaseStore`] over the shared SQLite catalog.
///
/// Every lock runs on its own pooled connection so a lease transaction
/// never interleaves with whatever the caller's connection is doing.
pub struct SqliteLeaseStore {
    pool: DbPool,
}

impl SqliteLeaseStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl LeaseStore for SqliteLeaseStore {
    fn lock(&self, id: ArtifactId) -> Result<Option<Box<dyn HeartbeatLock + '_>>> {
        let conn = get_conn(&self.pool)?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(db_err)?;

        let mut lock = SqliteHeartbeatLock {
            conn,
            id,
            heartbeat: None,
            finished: false,
        };

        match artifacts::artifact_heartbeat(&lock.conn, id)? {
            Some(heartbeat) => {
                lock.heartbeat = heartbeat;
                Ok(Some(Box::new(lock)))
            }
            None => {
                Box::new(lock).rollback()?;
                Ok(None)
            }
        }
    }
}

struct SqliteHeartbeatLock {
    conn: PooledConnection,
    id: ArtifactId,
    heartbeat: Option<DateTime<Utc>>,
    finished: bool,
}

impl SqliteHeartbeatLock {
    fn finish(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(db_err)?;
        self.finished = true;
        Ok(())
    }
}

impl HeartbeatLock for SqliteHeartbeatLock {
    fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.heartbeat
    }

    fn write_heartbeat(&mut self, at: DateTime<Utc>) -> Result<usize> {
        artifacts::write_heartbeat(&self.conn, self.id, at)
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish("COMMIT")
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

impl Drop for SqliteHeartbeatLock {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(artifact_id = %self.id, "Failed to roll back lease transaction: {e}");
            }
        }
    }
}
