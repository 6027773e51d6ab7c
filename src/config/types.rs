use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub files: FilesConfig,

    #[serde(default)]
    pub processors: Vec<ProcessorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Row id of this server in `processing_servers`
    #[serde(default = "default_server_id")]
    pub id: i64,
}

fn default_server_id() -> i64 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: default_server_id(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Path to the shared SQLite catalog
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// How long a writer waits for the catalog write lock
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./ingestd.sqlite")
}

fn default_busy_timeout() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Heartbeat period for leases and the server row
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Safety margin before a heartbeat counts as stale (minimum 10)
    #[serde(default = "default_lease_leeway")]
    pub lease_leeway_secs: u64,

    /// Delay between scheduler ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum number of jobs running at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Quota for the serving location; unlimited when unset
    #[serde(default)]
    pub storage_quota_bytes: Option<u64>,

    /// Copy the source into the working directory before processing
    #[serde(default)]
    pub work_with_copy: bool,
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_lease_leeway() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_workers() -> usize {
    2
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            lease_leeway_secs: default_lease_leeway(),
            poll_interval_secs: default_poll_interval(),
            workers: default_workers(),
            storage_quota_bytes: None,
            work_with_copy: false,
        }
    }
}

impl GeneralConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lease_leeway(&self) -> Duration {
        Duration::from_secs(self.lease_leeway_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesConfig {
    /// Serving location; artifact bytes live at `<files_dir>/<id>`
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,

    /// Uploads that have not been moved to the serving location yet
    #[serde(default = "default_pending_files_dir")]
    pub pending_files_dir: PathBuf,

    /// Root for per-job scratch directories, emptied on startup
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("./data/files")
}

fn default_pending_files_dir() -> PathBuf {
    PathBuf::from("./data/pending")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("./data/working")
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            files_dir: default_files_dir(),
            pending_files_dir: default_pending_files_dir(),
            working_dir: default_working_dir(),
        }
    }
}

/// An external command that processes one artifact type.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Artifact type handled by this processor
    pub type_id: i32,

    /// Program to run
    pub program: String,

    /// Arguments; `{input}`, `{working_dir}` and `{id}` are substituted
    #[serde(default)]
    pub args: Vec<String>,

    /// Files the program leaves in the working directory
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// A derived artifact produced by a command processor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// File name relative to the working directory
    pub file: String,

    /// Type id of the derived artifact
    pub type_id: i32,

    /// Optional catalog name for the derived artifact
    #[serde(default)]
    pub name: Option<String>,

    /// Skip the output instead of failing when the file is missing
    #[serde(default)]
    pub optional: bool,
}
