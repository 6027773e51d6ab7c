//! The poll scheduler.
//!
//! One tick runs three scans over a single catalog connection:
//!
//! 1. **Reprocess**: flag reprocess requests, then clear the derived
//!    children of each waiting artifact and send it back to `Pending`.
//! 2. **Delete**: remove artifacts marked for deletion or never put in use,
//!    children first.
//! 3. **Process**: lease pending artifacts, most recently updated first,
//!    and hand each to a [`Job`] on the blocking pool until every worker
//!    slot is taken.
//!
//! Artifacts whose heartbeat is live belong to some server and are skipped
//! by every scan.

mod deletion;

pub use deletion::remove_recursive;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ingestd_common::{ArtifactId, ArtifactTypeId, Error, OwnerToken, ProcessState, Result};
use ingestd_db::models::Artifact;
use ingestd_db::pool::get_conn;
use ingestd_db::queries::artifacts;
use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::context::AppContext;
use crate::finalizer::Job;
use crate::lease::{under_lease, Decision, Guarded, LeaseManager};

pub const QUEUED: &str = "Added to process queue.";

/// Artifacts with a Job submitted and not yet completed.
pub struct InFlight {
    ids: Mutex<HashSet<ArtifactId>>,
    leases: Arc<LeaseManager>,
}

impl InFlight {
    pub fn new(leases: Arc<LeaseManager>) -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
            leases,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    pub fn contains(&self, id: ArtifactId) -> bool {
        self.ids.lock().contains(&id)
    }

    fn insert(&self, id: ArtifactId) -> bool {
        self.ids.lock().insert(id)
    }

    fn remove(&self, id: ArtifactId) {
        self.ids.lock().remove(&id);
    }

    /// Completion handler for a finished Job: release its lease and free
    /// the worker slot. The slot is freed even if the release fails.
    pub fn complete(&self, id: ArtifactId, owner: OwnerToken) -> Result<()> {
        let released = self.leases.release(id, owner);
        self.remove(id);
        tracing::debug!(artifact_id = %id, "Job completed");
        released
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: usize,
    pub reset: usize,
    pub deleted: usize,
    pub dispatched: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    ctx: AppContext,
    workers: usize,
    poll_interval: Duration,
    in_flight: Arc<InFlight>,
    tick_lock: Mutex<()>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    runtime: Handle,
}

impl Scheduler {
    /// Must be called from within a Tokio runtime; Jobs run on its blocking
    /// pool.
    pub fn new(ctx: AppContext, workers: usize, poll_interval: Duration) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("scheduler needs a tokio runtime: {e}")))?;
        let in_flight = Arc::new(InFlight::new(ctx.leases.clone()));
        Ok(Self {
            ctx,
            workers,
            poll_interval,
            in_flight,
            tick_lock: Mutex::new(()),
            jobs: Mutex::new(Vec::new()),
            runtime,
        })
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Run one reprocess, delete and process pass.
    ///
    /// Blocks on the catalog. Problems with a single artifact are logged and
    /// the tick moves on; only fatal errors and failures to query the
    /// catalog at all are returned.
    pub fn tick(&self) -> Result<TickReport> {
        let _serial = self.tick_lock.lock();
        let conn = get_conn(&self.ctx.pool)?;
        let types = self.ctx.processors.type_ids();

        let mut report = TickReport::default();
        let (promoted, reset) = self.reprocess_scan(&conn, &types)?;
        report.promoted = promoted;
        report.reset = reset;
        report.deleted = self.delete_scan(&conn, &types)?;
        report.dispatched = self.process_scan(&conn, &types)?;
        Ok(report)
    }

    /// Tick every poll interval until shutdown, then wait for in-flight Jobs.
    pub async fn run(self: Arc<Self>) {
        let shutdown = self.ctx.shutdown.clone();
        tracing::info!(
            workers = self.workers,
            poll_secs = self.poll_interval.as_secs(),
            "Scheduler started"
        );

        while !shutdown.is_cancelled() {
            let scheduler = self.clone();
            match tokio::task::spawn_blocking(move || scheduler.tick()).await {
                Ok(Ok(report)) => {
                    if !report.is_idle() {
                        tracing::debug!(?report, "Tick finished");
                    }
                }
                Ok(Err(e)) if e.is_fatal() => {
                    shutdown.fatal(format!("scheduler tick failed: {e}"));
                    break;
                }
                Ok(Err(e)) => tracing::error!("Scheduler tick failed: {e}"),
                Err(e) => {
                    shutdown.fatal(format!("scheduler tick panicked: {e}"));
                    break;
                }
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.drain().await;
        tracing::info!("Scheduler stopped");
    }

    /// Wait for every submitted Job to finish.
    pub async fn drain(&self) {
        let handles = std::mem::take(&mut *self.jobs.lock());
        if !handles.is_empty() {
            tracing::info!(jobs = handles.len(), "Waiting for in-flight jobs");
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Job task failed: {e}");
            }
        }
    }

    fn reprocess_scan(&self, conn: &Connection, types: &[ArtifactTypeId]) -> Result<(usize, usize)> {
        let promoted = artifacts::promote_reprocess_requests(conn)?;
        if promoted > 0 {
            tracing::info!(count = promoted, "Reprocess requested");
        }

        let live_after = self.ctx.leases.timing().live_after(Utc::now());
        let mut reset = 0;
        for artifact in artifacts::list_awaiting_reprocess_cleanup(conn, live_after, types)? {
            let outcome = self.reset_for_reprocess(conn, &artifact);
            if contain(outcome, &artifact, "reprocess cleanup")? == Some(true) {
                reset += 1;
            }
        }
        Ok((promoted, reset))
    }

    fn reset_for_reprocess(&self, conn: &Connection, artifact: &Artifact) -> Result<bool> {
        let id = artifact.id;
        let leases = &self.ctx.leases;
        let owner = OwnerToken::new();
        if !leases.acquire(id, owner, false)? {
            return Ok(false);
        }

        let result = (|| -> Result<bool> {
            if !remove_recursive(&self.ctx, conn, artifact, false, owner)? {
                tracing::debug!(artifact_id = %id, "Children not yet removed, retrying next tick");
                return Ok(false);
            }
            let guarded = under_lease(conn, leases, id, owner, |tx| {
                Ok(Decision::Commit(artifacts::set_process_state_if(
                    tx,
                    id,
                    ProcessState::AwaitingReprocessCleanup,
                    ProcessState::Pending,
                )?))
            })?;
            Ok(matches!(guarded, Guarded::Committed(true)))
        })();

        let released = leases.release(id, owner);
        let reset = result?;
        released?;
        if reset {
            tracing::info!(artifact_id = %id, "Artifact queued for reprocessing");
        }
        Ok(reset)
    }

    fn delete_scan(&self, conn: &Connection, types: &[ArtifactTypeId]) -> Result<usize> {
        let live_after = self.ctx.leases.timing().live_after(Utc::now());
        let mut deleted = 0;
        for artifact in artifacts::list_delete_candidates(conn, live_after, types)? {
            let outcome = remove_recursive(&self.ctx, conn, &artifact, true, OwnerToken::new());
            if contain(outcome, &artifact, "deletion")? == Some(true) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn process_scan(&self, conn: &Connection, types: &[ArtifactTypeId]) -> Result<usize> {
        if self.in_flight.len() >= self.workers {
            return Ok(0);
        }

        let live_after = self.ctx.leases.timing().live_after(Utc::now());
        let mut dispatched = 0;
        for artifact in artifacts::list_process_candidates(conn, live_after, types)? {
            if self.in_flight.len() >= self.workers {
                break;
            }
            if self.in_flight.contains(artifact.id) {
                continue;
            }
            let summary = artifact.clone();
            if contain(self.dispatch(conn, artifact), &summary, "dispatch")? == Some(true) {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Lease `artifact` under a fresh token and submit its Job.
    fn dispatch(&self, conn: &Connection, artifact: Artifact) -> Result<bool> {
        let id = artifact.id;
        let leases = &self.ctx.leases;
        let owner = OwnerToken::new();
        if !leases.acquire(id, owner, false)? {
            tracing::debug!(artifact_id = %id, "Artifact claimed elsewhere");
            return Ok(false);
        }

        let submitted = artifacts::update_status(conn, id, QUEUED, None).and_then(|_| {
            if !self.in_flight.insert(id) {
                return Err(Error::lease_invariant(format!("artifact {id} is already in flight")));
            }
            let job = Job::new(self.ctx.clone(), artifact, owner, self.in_flight.clone());
            let handle = self.runtime.spawn_blocking(move || job.run());
            let mut jobs = self.jobs.lock();
            jobs.retain(|job| !job.is_finished());
            jobs.push(handle);
            Ok(())
        });

        if let Err(e) = submitted {
            self.in_flight.remove(id);
            if let Err(release) = leases.release(id, owner) {
                tracing::error!(artifact_id = %id, "Failed to release after dispatch error: {release}");
            }
            return Err(e);
        }

        tracing::info!(artifact_id = %id, "Job submitted");
        Ok(true)
    }
}

/// Keep one artifact's failure from ending the tick. Fatal errors still
/// propagate.
fn contain<T>(result: Result<T>, artifact: &Artifact, stage: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::error!(artifact_id = %artifact.id, stage, "Artifact skipped: {e}");
            Ok(None)
        }
    }
}
