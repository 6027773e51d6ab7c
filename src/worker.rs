//! Wiring for a running processing server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ingestd_db::pool::{init_pool, DbPool, PoolOptions};

use crate::config::Config;
use crate::context::AppContext;
use crate::lease::{run_renewal, LeaseManager, LeaseTiming, SqliteLeaseStore};
use crate::processor::ProcessorRegistry;
use crate::scheduler::Scheduler;
use crate::server_heartbeat::{self, run_server_heartbeat};
use crate::shutdown::Shutdown;
use crate::storage::Storage;

/// Connections beyond the workers' own: the scheduler tick, the lease store
/// (acquire and renewal) and the server heartbeat.
const EXTRA_CONNECTIONS: usize = 4;

/// Everything a running server needs, built from configuration.
pub struct Worker {
    pub ctx: AppContext,
    pub scheduler: Arc<Scheduler>,
    server_id: i64,
    heartbeat_interval: Duration,
}

impl Worker {
    /// Prepare the storage layout, open the catalog and build the services.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(config: &Config, shutdown: Shutdown) -> Result<Self> {
        let general = &config.general;

        let storage = Storage::new(&config.files, general.storage_quota_bytes);
        storage.ensure_layout()?;
        storage.clean_working_root()?;

        let options = PoolOptions {
            max_size: u32::try_from(general.workers * 2 + EXTRA_CONNECTIONS).unwrap_or(u32::MAX),
            busy_timeout: Duration::from_secs(config.database.busy_timeout_secs),
        };
        let db_path = config.database.path.to_string_lossy();
        tracing::info!(path = %db_path, "Opening catalog");
        let pool = init_pool(&db_path, options)
            .with_context(|| format!("Failed to open catalog at {db_path}"))?;

        let timing = LeaseTiming::new(general.heartbeat_interval(), general.lease_leeway());
        let leases = Arc::new(LeaseManager::new(
            Arc::new(SqliteLeaseStore::new(pool.clone())),
            timing,
        ));

        let processors = ProcessorRegistry::from_config(&config.processors);
        if processors.is_empty() {
            tracing::warn!("No processors configured, nothing will be processed or deleted");
        }

        let ctx = AppContext::new(
            pool,
            leases,
            processors,
            storage,
            shutdown,
            general.work_with_copy,
        );
        let scheduler = Arc::new(Scheduler::new(
            ctx.clone(),
            general.workers,
            general.poll_interval(),
        )?);

        Ok(Self {
            ctx,
            scheduler,
            server_id: config.server.id,
            heartbeat_interval: general.heartbeat_interval(),
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.ctx.pool
    }

    /// Run until Ctrl-C or a fatal error.
    ///
    /// On an orderly stop the scheduler stops ticking and waits for its
    /// jobs; leases keep being renewed until they are done.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();

        if let Err(e) = server_heartbeat::register(&self.ctx.pool, self.server_id) {
            tracing::warn!(server_id = self.server_id, "Failed to register server: {e}");
        }

        let renewal_stop = shutdown.linked();
        let renewal = tokio::spawn(run_renewal(self.ctx.leases.clone(), renewal_stop.clone()));
        let heartbeat = tokio::spawn(run_server_heartbeat(
            self.ctx.pool.clone(),
            self.server_id,
            self.heartbeat_interval,
            shutdown.clone(),
        ));
        let scheduler = tokio::spawn(self.scheduler.clone().run());

        tracing::info!(server_id = self.server_id, "Processing server started");

        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::info!("Shutdown requested");
                    shutdown.trigger();
                }
                Err(e) => {
                    tracing::warn!("Failed to listen for Ctrl-C: {e}");
                    shutdown.cancelled().await;
                }
            },
            _ = shutdown.cancelled() => {}
        }

        if let Err(e) = scheduler.await {
            tracing::error!("Scheduler task failed: {e}");
        }
        renewal_stop.trigger();
        for (name, task) in [("renewal", renewal), ("server heartbeat", heartbeat)] {
            if let Err(e) = task.await {
                tracing::error!(task = name, "Background task failed: {e}");
            }
        }

        tracing::info!(held = self.ctx.leases.held_count(), "Processing server stopped");
        match shutdown.fatal_reason() {
            Some(reason) => anyhow::bail!("stopped after a fatal error: {reason}"),
            None => Ok(()),
        }
    }
}
