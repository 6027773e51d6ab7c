//! On-disk layout of artifact bytes.
//!
//! Artifact bytes live at `<files_dir>/<id>`. Uploads the front end has not
//! moved into place yet live at `<pending_files_dir>/<id>`. Each job gets a
//! scratch directory `<working_root>/<id>` that is removed when it ends.
//! Quota is measured over `files_dir` only.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ingestd_common::{ArtifactId, Error, Result};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::config::FilesConfig;

#[derive(Debug, Clone)]
pub struct Storage {
    files_dir: PathBuf,
    pending_files_dir: PathBuf,
    working_root: PathBuf,
    quota_bytes: Option<u64>,
}

impl Storage {
    pub fn new(files: &FilesConfig, quota_bytes: Option<u64>) -> Self {
        Self {
            files_dir: files.files_dir.clone(),
            pending_files_dir: files.pending_files_dir.clone(),
            working_root: files.working_dir.clone(),
            quota_bytes,
        }
    }

    /// Where an artifact's bytes live once published.
    pub fn source_path(&self, id: ArtifactId) -> PathBuf {
        self.files_dir.join(id.to_string())
    }

    /// Where an artifact's bytes live before they are moved into place.
    pub fn pending_path(&self, id: ArtifactId) -> PathBuf {
        self.pending_files_dir.join(id.to_string())
    }

    pub fn working_dir_for(&self, id: ArtifactId) -> PathBuf {
        self.working_root.join(id.to_string())
    }

    /// Create the served and pending directories if they are missing.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.files_dir, &self.pending_files_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::environment(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Empty the working root, creating it if it does not exist. Anything
    /// in it belongs to jobs of a previous run of this server.
    pub fn clean_working_root(&self) -> Result<()> {
        if !self.working_root.exists() {
            tracing::info!(path = %self.working_root.display(), "Creating working directory");
            return fs::create_dir_all(&self.working_root).map_err(|e| {
                Error::environment(format!(
                    "cannot create working directory {}: {e}",
                    self.working_root.display()
                ))
            });
        }

        tracing::info!(path = %self.working_root.display(), "Cleaning working directory");
        let entries = fs::read_dir(&self.working_root).map_err(|e| {
            Error::environment(format!(
                "cannot read working directory {}: {e}",
                self.working_root.display()
            ))
        })?;
        for entry in entries {
            let path = entry?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| {
                Error::environment(format!("cannot remove {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    /// Create a fresh, empty working directory for one job.
    pub fn create_working_dir(&self, id: ArtifactId) -> io::Result<PathBuf> {
        let dir = self.working_dir_for(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove a job's working directory. Missing is fine.
    pub fn remove_working_dir(&self, id: ArtifactId) -> io::Result<()> {
        match fs::remove_dir_all(self.working_dir_for(id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Copy a file into a working directory, keeping its name.
    pub fn copy_into(&self, source: &Path, dir: &Path) -> io::Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;
        let dest = dir.join(name);
        fs::copy(source, &dest)?;
        Ok(dest)
    }

    /// Move a produced file into the serving location as artifact `id`,
    /// replacing anything already there.
    ///
    /// Copies into a temporary file beside the destination and renames it
    /// into place, so readers never see a partial file and the working
    /// directory may sit on another filesystem.
    pub fn publish(&self, produced: &Path, id: ArtifactId) -> io::Result<PathBuf> {
        let dest = self.source_path(id);
        let mut staged = NamedTempFile::new_in(&self.files_dir)?;
        let mut input = fs::File::open(produced)?;
        io::copy(&mut input, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(&dest).map_err(|e| e.error)?;

        if let Err(e) = fs::remove_file(produced) {
            tracing::warn!(path = %produced.display(), "Failed to remove published file: {e}");
        }
        Ok(dest)
    }

    /// Delete an artifact's bytes, looking in the serving location first
    /// and then the pending location. Returns whether a file was removed;
    /// absent bytes are not an error.
    pub fn remove_artifact_bytes(&self, id: ArtifactId) -> io::Result<bool> {
        for path in [self.source_path(id), self.pending_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    /// Bytes currently stored in the serving location.
    pub fn usage(&self) -> u64 {
        WalkDir::new(&self.files_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    /// Whether usage has reached the quota, allowing `additional` bytes of
    /// headroom. Always false without a quota.
    pub fn is_over_quota(&self, additional: u64) -> bool {
        let Some(quota) = self.quota_bytes else {
            return false;
        };
        let usage = self.usage();
        let over = usage >= quota.saturating_add(additional);
        tracing::debug!(usage, quota, additional, over, "Quota check");
        over
    }
}
