mod cli;

use ingestd::config::{self, Config};
use ingestd::processor::CommandProcessor;
use ingestd::shutdown::Shutdown;
use ingestd::worker::Worker;
use ingestd_common::ArtifactId;
use ingestd_db::pool::{get_conn, init_pool, PoolOptions};
use ingestd_db::queries::artifacts;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

async fn start(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    config::validate_config(&config)?;

    tracing::info!("Starting ingestd");
    tracing::info!(
        server_id = config.server.id,
        workers = config.general.workers,
        processors = config.processors.len(),
        "Loaded configuration"
    );

    let worker = Worker::build(&config, Shutdown::new())?;
    worker.run().await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "ingestd=trace,ingestd_db=debug,ingestd_common=debug".to_string()
        } else {
            "ingestd=debug,ingestd_db=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start(cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate(path.as_deref())
        }
        Commands::Inspect { id, json } => inspect(cli.config.as_deref(), ArtifactId::new(id), json),
        Commands::Version => {
            println!("ingestd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };
    config::validate_config(&config)?;

    println!("✓ Configuration is valid");
    println!("  Server id: {}", config.server.id);
    println!("  Catalog: {}", config.database.path.display());
    println!(
        "  Heartbeat: {}s (leeway {}s)",
        config.general.heartbeat_interval_secs, config.general.lease_leeway_secs
    );
    println!("  Workers: {}", config.general.workers);
    match config.general.storage_quota_bytes {
        Some(quota) => println!("  Storage quota: {} bytes", quota),
        None => println!("  Storage quota: none"),
    }
    println!("  Processors: {}", config.processors.len());

    let mut all_ok = true;
    for processor in &config.processors {
        let command = CommandProcessor::from_config(processor);
        match command.locate_program() {
            Some(path) => println!("    ✓ type {} - {}", processor.type_id, path.display()),
            None => {
                all_ok = false;
                println!("    ✗ type {} - {} not found", processor.type_id, command.program());
            }
        }
    }
    if !all_ok {
        println!("Some processor programs are missing.");
    }

    Ok(())
}

fn inspect(config_path: Option<&std::path::Path>, id: ArtifactId, json: bool) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let pool = init_pool(&config.database.path.to_string_lossy(), PoolOptions::default())?;
    let conn = get_conn(&pool)?;

    let Some(artifact) = artifacts::get_artifact(&conn, id)? else {
        anyhow::bail!("Artifact {} not found", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        return Ok(());
    }

    println!("Artifact {}", artifact.id);
    if let Some(ref name) = artifact.name {
        println!("  Name: {}", name);
    }
    println!("  Type: {}", artifact.type_id);
    println!("  Size: {} bytes", artifact.size);
    if let Some(parent) = artifact.source_artifact_id {
        println!("  Derived from: {}", parent);
    }
    println!("  State: {}", artifact.process_state);
    if let Some(ref msg) = artifact.msg {
        match artifact.process_percentage {
            Some(pct) => println!("  Status: {} ({}%)", msg, pct),
            None => println!("  Status: {}", msg),
        }
    }
    println!(
        "  Flags: ready_for_processing={} ready_for_delete={} in_use={} reprocess={}",
        artifact.ready_for_processing, artifact.ready_for_delete, artifact.in_use, artifact.reprocess
    );
    println!("  Processed successfully before: {}", artifact.has_processed_successfully);
    match artifact.heartbeat {
        Some(at) => println!("  Heartbeat: {}", at.to_rfc3339()),
        None => println!("  Heartbeat: never"),
    }

    Ok(())
}
