//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which creates a temporary directory holding a
//! file-backed SQLite catalog (so connections really contend for the write
//! lock) and the storage layout, and wires a full [`AppContext`] and
//! [`Scheduler`] over them.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use ingestd::config::FilesConfig;
use ingestd::context::AppContext;
use ingestd::lease::{LeaseManager, LeaseTiming, SqliteLeaseStore};
use ingestd::processor::{ProcessContext, ProcessingOutcome, Processor, ProcessorRegistry};
use ingestd::scheduler::{Scheduler, TickReport};
use ingestd::shutdown::Shutdown;
use ingestd::storage::Storage;
use ingestd_common::{ArtifactId, ArtifactTypeId, Result};
use ingestd_db::models::{to_db_time, Artifact, NewArtifact};
use ingestd_db::pool::{get_conn, init_pool, DbPool, PoolOptions, PooledConnection};
use ingestd_db::queries::artifacts;

pub const UPLOAD_TYPE: ArtifactTypeId = ArtifactTypeId::new(1);
pub const DERIVED_TYPE: ArtifactTypeId = ArtifactTypeId::new(2);

/// Knobs for [`TestHarness::build`].
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub workers: usize,
    pub quota_bytes: Option<u64>,
    pub work_with_copy: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            quota_bytes: None,
            work_with_copy: false,
        }
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub pool: DbPool,
    pub leases: Arc<LeaseManager>,
    pub ctx: AppContext,
    pub scheduler: Arc<Scheduler>,
}

impl TestHarness {
    /// A harness with one processor for [`UPLOAD_TYPE`].
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self::with_options(processor, HarnessOptions::default())
    }

    pub fn with_options(processor: Arc<dyn Processor>, options: HarnessOptions) -> Self {
        Self::build(options, |_| {
            let mut registry = ProcessorRegistry::new();
            registry.register(UPLOAD_TYPE, processor);
            registry
        })
    }

    /// Build with a registry that may capture the lease manager.
    pub fn build(
        options: HarnessOptions,
        processors: impl FnOnce(&Arc<LeaseManager>) -> ProcessorRegistry,
    ) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db_path = dir.path().join("catalog.sqlite");
        let pool = init_pool(
            db_path.to_str().unwrap(),
            PoolOptions {
                max_size: 16,
                busy_timeout: Duration::from_secs(30),
            },
        )
        .expect("failed to create pool");

        let files = FilesConfig {
            files_dir: dir.path().join("files"),
            pending_files_dir: dir.path().join("pending"),
            working_dir: dir.path().join("working"),
        };
        let storage = Storage::new(&files, options.quota_bytes);
        storage.ensure_layout().unwrap();

        let timing = LeaseTiming::new(Duration::from_secs(60), Duration::from_secs(30));
        let leases = Arc::new(LeaseManager::new(
            Arc::new(SqliteLeaseStore::new(pool.clone())),
            timing,
        ));
        let registry = processors(&leases);

        let ctx = AppContext::new(
            pool.clone(),
            leases.clone(),
            registry,
            storage,
            Shutdown::new(),
            options.work_with_copy,
        );
        let scheduler = Arc::new(
            Scheduler::new(ctx.clone(), options.workers, Duration::from_secs(1))
                .expect("scheduler needs a runtime"),
        );

        Self {
            dir,
            pool,
            leases,
            ctx,
            scheduler,
        }
    }

    pub fn conn(&self) -> PooledConnection {
        get_conn(&self.pool).unwrap()
    }

    pub fn files_path(&self, id: ArtifactId) -> PathBuf {
        self.ctx.storage.source_path(id)
    }

    pub fn working_path(&self, id: ArtifactId) -> PathBuf {
        self.ctx.storage.working_dir_for(id)
    }

    pub fn pending_path(&self, id: ArtifactId) -> PathBuf {
        self.ctx.storage.pending_path(id)
    }

    /// Insert a root upload ready for processing and write its bytes.
    pub fn upload(&self, bytes: &[u8]) -> Artifact {
        let new = NewArtifact::upload(UPLOAD_TYPE, "upload.bin", bytes.len() as i64);
        let artifact = artifacts::insert_artifact(&self.conn(), &new).unwrap();
        std::fs::write(self.files_path(artifact.id), bytes).unwrap();
        artifact
    }

    /// Insert an upload still attached to an upload session: not in use,
    /// never heartbeated, ready for processing.
    pub fn session_upload(&self, bytes: &[u8], session: &str) -> Artifact {
        let mut new = NewArtifact::upload(UPLOAD_TYPE, "session.bin", bytes.len() as i64);
        new.in_use = false;
        new.session_id = Some(session.to_string());
        let artifact = artifacts::insert_artifact(&self.conn(), &new).unwrap();
        std::fs::write(self.files_path(artifact.id), bytes).unwrap();
        artifact
    }

    /// Insert an in-use derived artifact with no heartbeat and write its
    /// bytes.
    pub fn derived(&self, parent: ArtifactId, bytes: &[u8]) -> Artifact {
        let mut new = NewArtifact::derived(parent, DERIVED_TYPE, Some("derived"), bytes.len() as i64, Utc::now());
        new.heartbeat = None;
        new.in_use = true;
        let artifact = artifacts::insert_artifact(&self.conn(), &new).unwrap();
        std::fs::write(self.files_path(artifact.id), bytes).unwrap();
        artifact
    }

    pub fn get(&self, id: ArtifactId) -> Artifact {
        artifacts::get_artifact(&self.conn(), id)
            .unwrap()
            .expect("artifact row missing")
    }

    pub fn exists(&self, id: ArtifactId) -> bool {
        artifacts::get_artifact(&self.conn(), id).unwrap().is_some()
    }

    pub fn children(&self, parent: ArtifactId) -> Vec<Artifact> {
        artifacts::list_removable_children(&self.conn(), parent, Utc::now() + chrono::Duration::days(1))
            .unwrap()
    }

    /// Run an arbitrary statement with the artifact id bound to `?1`.
    pub fn exec(&self, sql: &str, id: ArtifactId) {
        self.conn().execute(sql, [id.get()]).unwrap();
    }

    /// Make the artifact look abandoned by every server.
    pub fn expire_heartbeat(&self, id: ArtifactId) {
        self.exec("UPDATE artifacts SET heartbeat = NULL WHERE id = ?1", id);
    }

    pub fn set_heartbeat(&self, id: ArtifactId, at: DateTime<Utc>) {
        self.conn()
            .execute(
                "UPDATE artifacts SET heartbeat = ?1 WHERE id = ?2",
                rusqlite::params![to_db_time(at), id.get()],
            )
            .unwrap();
    }

    /// Run one scheduler tick on the blocking pool.
    pub async fn tick(&self) -> TickReport {
        let scheduler = self.scheduler.clone();
        tokio::task::spawn_blocking(move || scheduler.tick())
            .await
            .unwrap()
            .unwrap()
    }

    /// Run one tick and wait for every Job it submitted.
    pub async fn tick_and_drain(&self) -> TickReport {
        let report = self.tick().await;
        self.scheduler.drain().await;
        report
    }
}

type ProcessFn = dyn Fn(&ProcessContext<'_>) -> Result<ProcessingOutcome> + Send + Sync;

/// A processor backed by a closure that counts its invocations.
pub struct FnProcessor {
    f: Box<ProcessFn>,
    calls: AtomicUsize,
}

impl FnProcessor {
    pub fn new(
        f: impl Fn(&ProcessContext<'_>) -> Result<ProcessingOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            f: Box::new(f),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processor for FnProcessor {
    fn process(&self, ctx: &ProcessContext<'_>) -> Result<ProcessingOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.f)(ctx)
    }
}

/// Write `bytes` into the working directory and register them as one
/// derived artifact.
pub fn produce(ctx: &ProcessContext<'_>, name: &str, bytes: &[u8]) -> Result<Artifact> {
    let path = ctx.working_dir().join(name);
    std::fs::write(&path, bytes)?;
    ctx.register_derived(&path, DERIVED_TYPE, Some(name))
}
