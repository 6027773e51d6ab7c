//! Heartbeat leases over catalog rows.
//!
//! A lease gives one local owner token exclusive, time-bounded access to an
//! artifact across every server sharing the catalog. The only shared state
//! is the artifact's `heartbeat` column: a row whose heartbeat is within
//! `update_interval + leeway` of now belongs to somebody, and nobody else
//! may claim it. The holder keeps it that way by having the renewal daemon
//! rewrite the heartbeat every `update_interval - leeway`.
//!
//! Locally the manager keeps a registry of held leases. Acquiring an
//! artifact already held by the same token only bumps a refcount;
//! acquiring one held by a different token fails without touching the
//! catalog.

mod guard;
mod renewal;
mod store;

pub use guard::{under_lease, Decision, Guarded};
pub use renewal::run_renewal;
pub use store::{HeartbeatLock, LeaseStore, SqliteLeaseStore};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ingestd_common::{ArtifactId, Error, OwnerToken, Result};
use parking_lot::Mutex;

/// Heartbeat period and staleness margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    pub update_interval: Duration,
    pub leeway: Duration,
}

impl LeaseTiming {
    pub fn new(update_interval: Duration, leeway: Duration) -> Self {
        Self {
            update_interval,
            leeway,
        }
    }

    /// Heartbeats at or after the returned instant are live.
    pub fn live_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono_duration(self.update_interval + self.leeway)
    }

    /// How often the renewal daemon runs.
    pub fn renewal_period(&self) -> Duration {
        self.update_interval.saturating_sub(self.leeway)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Debug)]
struct Lease {
    owner: OwnerToken,
    refcount: u32,
    last_renewed: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct Registry {
    leases: HashMap<ArtifactId, Lease>,
    /// Artifacts with a catalog claim in progress.
    acquiring: HashSet<ArtifactId>,
    next_generation: u64,
}

/// Outcome of one renewal pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalReport {
    pub renewed: usize,
    pub revoked: usize,
}

/// Process-local registry of leases backed by a [`LeaseStore`].
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    timing: LeaseTiming,
    registry: Mutex<Registry>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, timing: LeaseTiming) -> Self {
        Self {
            store,
            timing,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn timing(&self) -> LeaseTiming {
        self.timing
    }

    /// Claim the lease on `id` for `owner`.
    ///
    /// Returns `Ok(false)` when someone else holds the artifact (locally or
    /// on another server) or the row no longer exists. `bypass_check` skips
    /// the staleness test and is only sound for a row the caller just
    /// inserted with a fresh heartbeat.
    ///
    /// Store failures are returned as [`Error::LeaseStore`], which is fatal.
    pub fn acquire(&self, id: ArtifactId, owner: OwnerToken, bypass_check: bool) -> Result<bool> {
        {
            let mut registry = self.registry.lock();
            if let Some(lease) = registry.leases.get_mut(&id) {
                if lease.owner == owner {
                    lease.refcount += 1;
                    tracing::trace!(artifact_id = %id, refcount = lease.refcount, "Lease re-entered");
                    return Ok(true);
                }
                tracing::debug!(artifact_id = %id, "Lease held by another local owner");
                return Ok(false);
            }
            if !registry.acquiring.insert(id) {
                tracing::debug!(artifact_id = %id, "Lease claim already in progress locally");
                return Ok(false);
            }
        }

        let claimed = self.claim(id, bypass_check);

        let mut registry = self.registry.lock();
        registry.acquiring.remove(&id);
        let Some(renewed_at) = claimed? else {
            return Ok(false);
        };

        registry.next_generation += 1;
        let generation = registry.next_generation;
        registry.leases.insert(
            id,
            Lease {
                owner,
                refcount: 1,
                last_renewed: renewed_at,
                generation,
            },
        );
        tracing::info!(artifact_id = %id, owner = %owner, "Lease acquired");
        Ok(true)
    }

    /// Take the row lock, judge staleness and write a fresh heartbeat.
    /// Returns when the heartbeat was written, or `None` if the claim lost.
    fn claim(&self, id: ArtifactId, bypass_check: bool) -> Result<Option<Instant>> {
        let requested = Instant::now();
        let lock = self
            .store
            .lock(id)
            .map_err(|e| Error::lease_store(format!("locking artifact {id}: {e}")))?;
        let wait = requested.elapsed();

        let Some(mut lock) = lock else {
            tracing::debug!(artifact_id = %id, "Artifact vanished before it could be leased");
            return Ok(None);
        };

        if !bypass_check {
            if let Some(heartbeat) = lock.heartbeat() {
                // The holder may have been queued behind us for the whole
                // wait, unable to renew, so judge the heartbeat as of the
                // moment the lock was requested.
                let effective = heartbeat + chrono_duration(wait);
                if effective >= self.timing.live_after(Utc::now()) {
                    tracing::debug!(
                        artifact_id = %id,
                        wait_ms = wait.as_millis() as u64,
                        "Artifact heartbeat is live elsewhere"
                    );
                    lock.rollback()
                        .map_err(|e| Error::lease_store(format!("rolling back artifact {id}: {e}")))?;
                    return Ok(None);
                }
            }
        }

        let renewed_at = Instant::now();
        let written = lock
            .write_heartbeat(Utc::now())
            .map_err(|e| Error::lease_store(format!("writing heartbeat for {id}: {e}")))?;
        if written != 1 {
            lock.rollback()
                .map_err(|e| Error::lease_store(format!("rolling back artifact {id}: {e}")))?;
            return Ok(None);
        }
        lock.commit()
            .map_err(|e| Error::lease_store(format!("committing heartbeat for {id}: {e}")))?;

        Ok(Some(renewed_at))
    }

    /// Hand a held lease to another token without touching the catalog.
    ///
    /// Returns `Ok(false)` if the lease is no longer held (it may have been
    /// revoked). A lease held by a token other than `old` is an invariant
    /// violation.
    pub fn switch_owner(&self, id: ArtifactId, old: OwnerToken, new: OwnerToken) -> Result<bool> {
        let mut registry = self.registry.lock();
        let Some(lease) = registry.leases.get_mut(&id) else {
            return Ok(false);
        };
        if lease.owner != old {
            return Err(Error::lease_invariant(format!(
                "switching owner of artifact {id} from {old}, but it is held by {}",
                lease.owner
            )));
        }
        lease.owner = new;
        tracing::debug!(artifact_id = %id, from = %old, to = %new, "Lease changed owner");
        Ok(true)
    }

    /// Whether any local owner holds the lease on `id`.
    pub fn is_leased(&self, id: ArtifactId) -> bool {
        self.registry.lock().leases.contains_key(&id)
    }

    /// Whether `owner` holds the lease on `id`.
    pub fn is_held_by(&self, id: ArtifactId, owner: OwnerToken) -> bool {
        self.registry
            .lock()
            .leases
            .get(&id)
            .is_some_and(|lease| lease.owner == owner)
    }

    /// Number of artifacts currently leased by this process.
    pub fn held_count(&self) -> usize {
        self.registry.lock().leases.len()
    }

    /// Drop one reference to the lease on `id`.
    ///
    /// The lease is removed when the last reference goes. Releasing an
    /// artifact that is not held is a no-op; releasing with the wrong token
    /// is an invariant violation.
    pub fn release(&self, id: ArtifactId, owner: OwnerToken) -> Result<()> {
        let mut registry = self.registry.lock();
        let Some(lease) = registry.leases.get_mut(&id) else {
            tracing::debug!(artifact_id = %id, "Releasing a lease that is not held");
            return Ok(());
        };
        if lease.owner != owner {
            return Err(Error::lease_invariant(format!(
                "artifact {id} released by {owner}, but it is held by {}",
                lease.owner
            )));
        }

        lease.refcount -= 1;
        if lease.refcount == 0 {
            registry.leases.remove(&id);
            tracing::info!(artifact_id = %id, "Lease released");
        }
        Ok(())
    }

    /// Forcibly drop the lease on `id` regardless of owner or refcount.
    /// Returns whether a lease was held.
    pub fn revoke(&self, id: ArtifactId) -> bool {
        let removed = self.registry.lock().leases.remove(&id).is_some();
        if removed {
            tracing::warn!(artifact_id = %id, "Lease revoked");
        }
        removed
    }

    fn revoke_generation(&self, id: ArtifactId, generation: u64, reason: &str) -> bool {
        let mut registry = self.registry.lock();
        let current = registry.leases.get(&id).map(|lease| lease.generation);
        if current != Some(generation) {
            return false;
        }
        registry.leases.remove(&id);
        tracing::warn!(artifact_id = %id, reason, "Lease revoked");
        true
    }

    /// Rewrite the heartbeat of every held lease.
    ///
    /// A lease whose row has vanished, or whose last renewal is older than
    /// the update interval, can no longer be vouched for and is revoked.
    /// Store failures are fatal.
    pub fn renew_all(&self) -> Result<RenewalReport> {
        let snapshot: Vec<(ArtifactId, u64, Instant)> = self
            .registry
            .lock()
            .leases
            .iter()
            .map(|(id, lease)| (*id, lease.generation, lease.last_renewed))
            .collect();

        let mut report = RenewalReport::default();
        for (id, generation, last_renewed) in snapshot {
            let lock = self
                .store
                .lock(id)
                .map_err(|e| Error::lease_store(format!("locking artifact {id} for renewal: {e}")))?;

            let Some(mut lock) = lock else {
                if self.revoke_generation(id, generation, "artifact row no longer exists") {
                    report.revoked += 1;
                }
                continue;
            };

            if last_renewed.elapsed() > self.timing.update_interval {
                lock.rollback()
                    .map_err(|e| Error::lease_store(format!("rolling back renewal of {id}: {e}")))?;
                if self.revoke_generation(id, generation, "renewal overdue") {
                    report.revoked += 1;
                }
                continue;
            }

            let renewed_at = Instant::now();
            let written = lock
                .write_heartbeat(Utc::now())
                .map_err(|e| Error::lease_store(format!("renewing heartbeat for {id}: {e}")))?;
            lock.commit()
                .map_err(|e| Error::lease_store(format!("committing renewal of {id}: {e}")))?;
            if written != 1 {
                if self.revoke_generation(id, generation, "heartbeat was not written") {
                    report.revoked += 1;
                }
                continue;
            }

            let mut registry = self.registry.lock();
            if let Some(lease) = registry.leases.get_mut(&id) {
                if lease.generation == generation {
                    lease.last_renewed = renewed_at;
                    report.renewed += 1;
                }
            }
        }

        Ok(report)
    }
}
