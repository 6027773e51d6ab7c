mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Smallest leeway accepted for lease staleness checks, in seconds.
pub const MIN_LEASE_LEEWAY_SECS: u64 = 10;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    parse_config(&content).with_context(|| format!("Invalid config file: {:?}", path))
}

/// Parse and validate configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;

    validate_config(&config)?;
    expand_paths(&mut config);

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./ingestd.toml",
        "~/.config/ingestd/config.toml",
        "/etc/ingestd/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

fn expand(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

fn expand_paths(config: &mut Config) {
    config.database.path = expand(&config.database.path);
    config.files.files_dir = expand(&config.files.files_dir);
    config.files.pending_files_dir = expand(&config.files.pending_files_dir);
    config.files.working_dir = expand(&config.files.working_dir);
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    let general = &config.general;

    if general.lease_leeway_secs < MIN_LEASE_LEEWAY_SECS {
        anyhow::bail!(
            "lease_leeway_secs must be at least {MIN_LEASE_LEEWAY_SECS}, got {}",
            general.lease_leeway_secs
        );
    }

    let min_interval = MIN_LEASE_LEEWAY_SECS + general.lease_leeway_secs;
    if general.heartbeat_interval_secs < min_interval {
        anyhow::bail!(
            "heartbeat_interval_secs must be at least {min_interval} (10s plus leeway), got {}",
            general.heartbeat_interval_secs
        );
    }

    if general.workers == 0 {
        anyhow::bail!("workers must be at least 1");
    }

    if general.poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be at least 1");
    }

    let mut seen = HashSet::new();
    for processor in &config.processors {
        if !seen.insert(processor.type_id) {
            anyhow::bail!("Duplicate processor for type {}", processor.type_id);
        }
        if processor.program.trim().is_empty() {
            anyhow::bail!("Processor for type {} has no program", processor.type_id);
        }
        for output in &processor.outputs {
            if output.file.trim().is_empty() {
                anyhow::bail!(
                    "Processor for type {} declares an output with no file",
                    processor.type_id
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = parse_config("").unwrap();
        assert_eq!(config.general.heartbeat_interval_secs, 60);
        assert_eq!(config.general.lease_leeway_secs, 30);
        assert_eq!(config.general.workers, 2);
        assert!(config.general.storage_quota_bytes.is_none());
        assert!(config.processors.is_empty());
        validate_config(&Config::default()).unwrap();
    }

    #[test]
    fn test_full_config() {
        let config = parse_config(
            r#"
            [server]
            id = 7

            [database]
            path = "/var/lib/ingestd/catalog.sqlite"

            [general]
            heartbeat_interval_secs = 45
            lease_leeway_secs = 15
            workers = 4
            storage_quota_bytes = 1000000
            work_with_copy = true

            [files]
            files_dir = "/srv/files"

            [[processors]]
            type_id = 1
            program = "ffmpeg"
            args = ["-i", "{input}", "{working_dir}/thumb.jpg"]

            [[processors.outputs]]
            file = "thumb.jpg"
            type_id = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.server.id, 7);
        assert_eq!(config.general.workers, 4);
        assert_eq!(config.general.storage_quota_bytes, Some(1_000_000));
        assert!(config.general.work_with_copy);
        assert_eq!(config.files.files_dir, PathBuf::from("/srv/files"));
        assert_eq!(config.processors[0].outputs[0].type_id, 2);
        assert!(!config.processors[0].outputs[0].optional);
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse_config(include_str!("../../ingestd.example.toml")).unwrap();
        assert_eq!(config.processors.len(), 1);
        assert_eq!(config.processors[0].outputs[0].name.as_deref(), Some("thumbnail-{id}.jpg"));
    }

    #[test]
    fn test_rejects_small_leeway() {
        let err = parse_config("[general]\nlease_leeway_secs = 5\n").unwrap_err();
        assert!(format!("{err:#}").contains("lease_leeway_secs"));
    }

    #[test]
    fn test_rejects_short_heartbeat_interval() {
        let err = parse_config("[general]\nheartbeat_interval_secs = 39\nlease_leeway_secs = 30\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("heartbeat_interval_secs"));

        parse_config("[general]\nheartbeat_interval_secs = 40\nlease_leeway_secs = 30\n").unwrap();
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(parse_config("[general]\nworkers = 0\n").is_err());
    }

    #[test]
    fn test_rejects_duplicate_processors() {
        let err = parse_config(
            r#"
            [[processors]]
            type_id = 1
            program = "a"

            [[processors]]
            type_id = 1
            program = "b"
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("Duplicate processor"));
    }

    #[test]
    fn test_tilde_paths_are_expanded() {
        let config = parse_config("[files]\nworking_dir = \"~/ingestd-work\"\n").unwrap();
        assert!(!config.files.working_dir.to_string_lossy().starts_with('~'));
    }
}
