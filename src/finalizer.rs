//! The per-artifact Job: run a processor and commit its outcome once.
//!
//! A Job arrives holding a lease taken by the scheduler. It moves that lease
//! to its own token, prepares a working directory, runs the processor for
//! the artifact's type and then records the outcome under a lease-checked
//! write lock. If the lease was revoked while the processor ran, the commit
//! is abandoned and the artifact is left as the new owner finds it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use ingestd_common::{ArtifactId, Error, OwnerToken, Result};
use ingestd_db::models::Artifact;
use ingestd_db::pool::get_conn;
use ingestd_db::queries::artifacts;
use rusqlite::Connection;

use crate::context::AppContext;
use crate::lease::{under_lease, Decision, Guarded};
use crate::processor::{ProcessContext, ProcessingOutcome};
use crate::scheduler::InFlight;
use crate::shutdown::Shutdown;

pub const PROCESSING: &str = "Processing.";
pub const FINALIZING: &str = "Finalizing.";
pub const NO_FREE_SPACE: &str = "No free storage space.";
pub const OUT_OF_SPACE: &str = "Ran out of storage space.";
pub const COPY_FAILED: &str = "Error copying source file.";
pub const PROCESSING_ERROR: &str = "Error processing file.";
pub const NO_PROCESSOR: &str = "No processor registered for this type.";
pub const FINALIZE_FAILED: &str = "Error finalizing processed files.";

/// Commit passes: the first may downgrade to failure, the second records it.
const COMMIT_PASSES: usize = 2;

/// Why a commit pass rolled back.
#[derive(Debug)]
enum Rejected {
    PartialMark { expected: usize, marked: usize },
    OutcomeNotRecorded { written: usize },
}

/// Whether a failed outcome may cost the artifact its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    /// The attempt got far enough that the retention policy applies.
    Apply,
    /// The source was never handed to a processor; leave it alone.
    Keep,
}

/// Runs the scheduler's completion handler when the Job ends, however it
/// ends.
struct Completion {
    in_flight: Arc<InFlight>,
    shutdown: Shutdown,
    id: ArtifactId,
    owner: OwnerToken,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Err(e) = self.in_flight.complete(self.id, self.owner) {
            self.shutdown
                .fatal(format!("completing job for artifact {}: {e}", self.id));
        }
    }
}

/// One unit of work for the worker pool.
pub struct Job {
    ctx: AppContext,
    artifact: Artifact,
    scheduler_owner: OwnerToken,
    in_flight: Arc<InFlight>,
}

impl Job {
    pub fn new(
        ctx: AppContext,
        artifact: Artifact,
        scheduler_owner: OwnerToken,
        in_flight: Arc<InFlight>,
    ) -> Self {
        Self {
            ctx,
            artifact,
            scheduler_owner,
            in_flight,
        }
    }

    /// Run to completion on the current (blocking) thread.
    pub fn run(self) {
        let id = self.artifact.id;
        let span = tracing::info_span!("job", artifact_id = %id, type_id = %self.artifact.type_id);
        let _enter = span.enter();

        let mut completion = Completion {
            in_flight: self.in_flight.clone(),
            shutdown: self.ctx.shutdown.clone(),
            id,
            owner: self.scheduler_owner,
        };

        match self.execute(&mut completion) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                self.ctx.shutdown.fatal(format!("job for artifact {id}: {e}"));
            }
            Err(e) => tracing::error!("Job failed: {e}"),
        }
    }

    fn execute(&self, completion: &mut Completion) -> Result<()> {
        let id = self.artifact.id;
        let leases = &self.ctx.leases;
        let conn = get_conn(&self.ctx.pool)?;

        let worker = OwnerToken::new();
        if !leases.switch_owner(id, self.scheduler_owner, worker)? {
            tracing::warn!("Lease lost before the job started, skipping");
            return Ok(());
        }
        completion.owner = worker;

        artifacts::mark_process_start(&conn, id, Utc::now())?;
        tracing::info!("Processing started");

        let mut registered = Vec::new();
        let result = self.process_and_commit(&conn, worker, &mut registered);

        let mut release_error = None;
        for derived in &registered {
            if let Err(e) = leases.release(derived.id, worker) {
                tracing::error!(derived_id = %derived.id, "Failed to release derived artifact: {e}");
                release_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.ctx.storage.remove_working_dir(id) {
            tracing::warn!("Failed to remove working directory: {e}");
        }

        if let Err(e) = artifacts::mark_process_end(&conn, id, Utc::now()) {
            tracing::warn!("Failed to record process end time: {e}");
        }

        result?;
        release_error.map_or(Ok(()), Err)
    }

    fn process_and_commit(
        &self,
        conn: &Connection,
        worker: OwnerToken,
        registered: &mut Vec<Artifact>,
    ) -> Result<()> {
        let id = self.artifact.id;
        let storage = &self.ctx.storage;

        let working_dir = storage.create_working_dir(id).map_err(|e| {
            Error::environment(format!("cannot create working directory for artifact {id}: {e}"))
        })?;

        let (mut outcome, retention) = self.produce(conn, worker, &working_dir, registered)?;

        let source_size = u64::try_from(self.artifact.size).unwrap_or(0);
        if outcome.success && storage.is_over_quota(source_size) {
            tracing::warn!("Storage quota exceeded after processing");
            outcome.success = false;
            outcome.message = OUT_OF_SPACE.to_string();
        }

        if !outcome.success && retention == Retention::Apply {
            self.apply_retention(conn, worker)?;
        }

        self.commit(conn, worker, outcome)
    }

    /// Run the processor, turning every recoverable problem into a failed
    /// outcome. Failures found before the processor is invoked, other than
    /// a full disk, keep the source.
    fn produce(
        &self,
        conn: &Connection,
        worker: OwnerToken,
        working_dir: &Path,
        registered: &mut Vec<Artifact>,
    ) -> Result<(ProcessingOutcome, Retention)> {
        let id = self.artifact.id;
        let storage = &self.ctx.storage;

        if storage.is_over_quota(0) {
            tracing::warn!("Storage quota already reached, not processing");
            return Ok((ProcessingOutcome::failed(NO_FREE_SPACE), Retention::Apply));
        }

        let Some(processor) = self.ctx.processors.get(self.artifact.type_id) else {
            tracing::warn!("No processor registered for type {}", self.artifact.type_id);
            return Ok((ProcessingOutcome::failed(NO_PROCESSOR), Retention::Keep));
        };

        let original = storage.source_path(id);
        let source_file = if self.ctx.work_with_copy {
            match storage.copy_into(&original, working_dir) {
                Ok(copy) => copy,
                Err(e) => {
                    tracing::warn!(source = %original.display(), "Failed to copy source: {e}");
                    return Ok((ProcessingOutcome::failed(COPY_FAILED), Retention::Keep));
                }
            }
        } else {
            original
        };

        artifacts::update_status(conn, id, PROCESSING, None)?;

        let pctx = ProcessContext::new(
            conn,
            &self.ctx.leases,
            storage,
            &self.artifact,
            worker,
            source_file,
            working_dir.to_path_buf(),
            self.ctx.work_with_copy,
        );
        let result = catch_unwind(AssertUnwindSafe(|| processor.process(&pctx)));

        registered.extend(pctx.registered());
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_fatal() => return Err(e),
            Ok(Err(e)) => {
                tracing::error!("Processor failed: {e}");
                pctx.fail(PROCESSING_ERROR)
            }
            Err(_) => {
                tracing::error!("Processor panicked");
                pctx.fail(PROCESSING_ERROR)
            }
        };

        for derived in &outcome.new_artifacts {
            if !registered.iter().any(|known| known.id == derived.id) {
                registered.push(derived.clone());
            }
        }
        Ok((outcome, Retention::Apply))
    }

    /// Drop the source of an artifact that has never processed successfully.
    fn apply_retention(&self, conn: &Connection, worker: OwnerToken) -> Result<()> {
        let id = self.artifact.id;
        match artifacts::has_processed_successfully(conn, id)? {
            Some(false) => {
                if !self.ctx.leases.is_held_by(id, worker) {
                    tracing::warn!("Lease lost, keeping source");
                    return Ok(());
                }
                if self.ctx.storage.remove_artifact_bytes(id)? {
                    tracing::info!("Removed source of a first-attempt failure");
                }
            }
            Some(true) => tracing::debug!("Keeping source of a reprocessing failure"),
            None => tracing::warn!("Artifact row vanished during processing"),
        }
        Ok(())
    }

    fn commit(&self, conn: &Connection, worker: OwnerToken, mut outcome: ProcessingOutcome) -> Result<()> {
        let id = self.artifact.id;
        let leases = &self.ctx.leases;
        let derived: Vec<ArtifactId> = outcome.new_artifacts.iter().map(|a| a.id).collect();

        artifacts::update_status(conn, id, FINALIZING, None)?;

        for _ in 0..COMMIT_PASSES {
            let success = outcome.success;
            let message = outcome.message.clone();

            let guarded = under_lease(conn, leases, id, worker, |tx| {
                if success && !derived.is_empty() {
                    let marked = artifacts::mark_in_use(tx, &derived)?;
                    if marked != derived.len() {
                        return Ok(Decision::Rollback(Err(Rejected::PartialMark {
                            expected: derived.len(),
                            marked,
                        })));
                    }
                }
                let written = artifacts::record_outcome(tx, id, success, &message)?;
                if written != 1 {
                    return Ok(Decision::Rollback(Err(Rejected::OutcomeNotRecorded { written })));
                }
                Ok(Decision::Commit(Ok(())))
            })?;

            match guarded {
                Guarded::Committed(_) => {
                    tracing::info!(success, message = %message, derived = derived.len(), "Outcome committed");
                    return Ok(());
                }
                Guarded::RolledBack(Err(Rejected::PartialMark { expected, marked })) => {
                    tracing::error!(expected, marked, "Derived artifacts only partly marked in use, recording failure");
                    outcome.success = false;
                    outcome.message = FINALIZE_FAILED.to_string();
                }
                Guarded::RolledBack(Err(Rejected::OutcomeNotRecorded { written })) => {
                    tracing::error!(written, "Outcome update touched an unexpected number of rows");
                    return Ok(());
                }
                Guarded::RolledBack(Ok(())) => {
                    tracing::error!("Commit pass rolled back without a reason");
                    return Ok(());
                }
                Guarded::Missing => {
                    tracing::warn!("Artifact deleted before commit");
                    return Ok(());
                }
                Guarded::LeaseLost => {
                    tracing::warn!("Lease lost before commit, leaving artifact untouched");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
