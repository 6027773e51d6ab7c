//! Pluggable per-type processing.
//!
//! A [`Processor`] turns one source artifact into zero or more derived
//! artifacts. It works inside a [`ProcessContext`], which gives it the
//! source file and a scratch directory, lets it report progress, and
//! registers each derived artifact so no other server can touch it before
//! the job commits.

mod command;
mod template;

pub use command::CommandProcessor;
pub use template::TemplateContext;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ingestd_common::{ArtifactTypeId, Error, OwnerToken, Result};
use ingestd_db::models::{Artifact, NewArtifact};
use ingestd_db::queries::artifacts;
use rusqlite::Connection;

use crate::config::ProcessorConfig;
use crate::lease::LeaseManager;
use crate::storage::Storage;

/// How many times a derived row insert is attempted under write contention.
pub const INSERT_ATTEMPTS: usize = 3;

/// What a processing attempt produced.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub success: bool,
    pub message: String,
    pub new_artifacts: Vec<Artifact>,
}

impl ProcessingOutcome {
    /// A failure with no derived artifacts.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            new_artifacts: Vec::new(),
        }
    }
}

/// Processes artifacts of one type.
pub trait Processor: Send + Sync {
    /// Process `ctx.artifact()`.
    ///
    /// Return `Ok` with a failed outcome for problems with the input; an
    /// `Err` is logged and recorded as a generic processing failure, unless
    /// it is fatal.
    fn process(&self, ctx: &ProcessContext<'_>) -> Result<ProcessingOutcome>;
}

/// Everything a processor may use while handling one artifact.
pub struct ProcessContext<'a> {
    conn: &'a Connection,
    leases: &'a LeaseManager,
    storage: &'a Storage,
    artifact: &'a Artifact,
    owner: OwnerToken,
    source_file: PathBuf,
    working_dir: PathBuf,
    working_with_copy: bool,
    registered: RefCell<Vec<Artifact>>,
}

impl<'a> ProcessContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: &'a Connection,
        leases: &'a LeaseManager,
        storage: &'a Storage,
        artifact: &'a Artifact,
        owner: OwnerToken,
        source_file: PathBuf,
        working_dir: PathBuf,
        working_with_copy: bool,
    ) -> Self {
        Self {
            conn,
            leases,
            storage,
            artifact,
            owner,
            source_file,
            working_dir,
            working_with_copy,
            registered: RefCell::new(Vec::new()),
        }
    }

    pub fn artifact(&self) -> &Artifact {
        self.artifact
    }

    /// The file to read. A private copy when `working_with_copy()` is set.
    pub fn source_file(&self) -> &Path {
        &self.source_file
    }

    /// Scratch directory, removed after the job.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn working_with_copy(&self) -> bool {
        self.working_with_copy
    }

    /// Publish a progress message, with an optional 0 to 100 percentage.
    pub fn update_status(&self, msg: &str, percentage: Option<i32>) -> Result<()> {
        artifacts::update_status(self.conn, self.artifact.id, msg, percentage)?;
        Ok(())
    }

    /// Whether the serving location is over quota, allowing `additional`
    /// bytes of headroom.
    pub fn is_over_quota(&self, additional: u64) -> bool {
        self.storage.is_over_quota(additional)
    }

    /// Register a produced file as a derived artifact of the one being
    /// processed.
    ///
    /// Inserts the row already successful, not in use and with a fresh
    /// heartbeat, leases it under this job's token, then moves the file
    /// into the serving location. The artifact is handed to the job for
    /// commit and must be included in the outcome to be put in use.
    pub fn register_derived(
        &self,
        produced: &Path,
        type_id: ArtifactTypeId,
        name: Option<&str>,
    ) -> Result<Artifact> {
        let size = std::fs::metadata(produced)?.len();
        let size = i64::try_from(size)
            .map_err(|_| Error::invalid_input(format!("{} is too large", produced.display())))?;

        let mut attempt = 1;
        let derived = loop {
            let new = NewArtifact::derived(self.artifact.id, type_id, name, size, Utc::now());
            match artifacts::insert_artifact(self.conn, &new) {
                Ok(derived) => break derived,
                Err(e) if e.is_write_conflict() && attempt < INSERT_ATTEMPTS => {
                    tracing::warn!(
                        artifact_id = %self.artifact.id,
                        attempt,
                        "Write conflict registering derived artifact, retrying: {e}"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        if !self.leases.acquire(derived.id, self.owner, true)? {
            return Err(Error::internal(format!(
                "could not lease freshly inserted artifact {}",
                derived.id
            )));
        }
        self.registered.borrow_mut().push(derived.clone());

        self.storage.publish(produced, derived.id)?;
        tracing::info!(
            artifact_id = %self.artifact.id,
            derived_id = %derived.id,
            type_id = %type_id,
            size,
            "Registered derived artifact"
        );
        Ok(derived)
    }

    /// Derived artifacts registered so far.
    pub fn registered(&self) -> Vec<Artifact> {
        self.registered.borrow().clone()
    }

    /// A successful outcome carrying every registered artifact.
    pub fn succeed(&self, message: impl Into<String>) -> ProcessingOutcome {
        ProcessingOutcome {
            success: true,
            message: message.into(),
            new_artifacts: self.registered(),
        }
    }

    /// A failed outcome. Registered artifacts are carried along so their
    /// leases are released, but a failure never puts them in use.
    pub fn fail(&self, message: impl Into<String>) -> ProcessingOutcome {
        ProcessingOutcome {
            success: false,
            message: message.into(),
            new_artifacts: self.registered(),
        }
    }
}

/// Processors keyed by the artifact type they handle.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<ArtifactTypeId, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command processors from configuration.
    pub fn from_config(configs: &[ProcessorConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(
                ArtifactTypeId::new(config.type_id),
                Arc::new(CommandProcessor::from_config(config)),
            );
        }
        registry
    }

    /// Register a processor, replacing any previous one for the type.
    pub fn register(&mut self, type_id: ArtifactTypeId, processor: Arc<dyn Processor>) {
        if self.processors.insert(type_id, processor).is_some() {
            tracing::warn!(type_id = %type_id, "Replaced processor");
        }
    }

    pub fn get(&self, type_id: ArtifactTypeId) -> Option<Arc<dyn Processor>> {
        self.processors.get(&type_id).cloned()
    }

    /// Every known type, in ascending order.
    pub fn type_ids(&self) -> Vec<ArtifactTypeId> {
        let mut ids: Vec<_> = self.processors.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesConfig;
    use crate::lease::{LeaseTiming, SqliteLeaseStore};
    use ingestd_db::pool::{get_conn, init_pool, PoolOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Noop;

    impl Processor for Noop {
        fn process(&self, ctx: &ProcessContext<'_>) -> Result<ProcessingOutcome> {
            Ok(ctx.succeed("nothing to do"))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProcessorRegistry::new();
        assert!(registry.is_empty());
        registry.register(ArtifactTypeId::new(3), Arc::new(Noop));
        registry.register(ArtifactTypeId::new(1), Arc::new(Noop));

        assert_eq!(
            registry.type_ids(),
            vec![ArtifactTypeId::new(1), ArtifactTypeId::new(3)]
        );
        assert!(registry.get(ArtifactTypeId::new(2)).is_none());
        assert!(registry.get(ArtifactTypeId::new(3)).is_some());
    }

    #[test]
    fn test_register_derived() {
        let tmp = TempDir::new().unwrap();
        let pool = init_pool(
            tmp.path().join("catalog.sqlite").to_str().unwrap(),
            PoolOptions::default(),
        )
        .unwrap();
        let storage = Storage::new(
            &FilesConfig {
                files_dir: tmp.path().join("files"),
                pending_files_dir: tmp.path().join("pending"),
                working_dir: tmp.path().join("working"),
            },
            None,
        );
        storage.ensure_layout().unwrap();
        let leases = LeaseManager::new(
            Arc::new(SqliteLeaseStore::new(pool.clone())),
            LeaseTiming::new(Duration::from_secs(60), Duration::from_secs(30)),
        );

        let conn = get_conn(&pool).unwrap();
        let parent = artifacts::insert_artifact(
            &conn,
            &NewArtifact::upload(ArtifactTypeId::new(1), "clip.mp4", 3),
        )
        .unwrap();
        let owner = OwnerToken::new();
        let working_dir = storage.create_working_dir(parent.id).unwrap();
        let ctx = ProcessContext::new(
            &conn,
            &leases,
            &storage,
            &parent,
            owner,
            storage.source_path(parent.id),
            working_dir.clone(),
            false,
        );

        let produced = working_dir.join("thumb.jpg");
        std::fs::write(&produced, b"jpeg").unwrap();
        let derived = ctx
            .register_derived(&produced, ArtifactTypeId::new(2), Some("thumb"))
            .unwrap();

        assert_eq!(derived.source_artifact_id, Some(parent.id));
        assert_eq!(derived.size, 4);
        assert!(!derived.in_use);
        assert!(derived.heartbeat.is_some());
        assert!(leases.is_held_by(derived.id, owner));
        assert_eq!(std::fs::read(storage.source_path(derived.id)).unwrap(), b"jpeg");
        assert!(!produced.exists());

        let outcome = ctx.fail("later step broke");
        assert!(!outcome.success);
        assert_eq!(outcome.new_artifacts.len(), 1);
    }
}
