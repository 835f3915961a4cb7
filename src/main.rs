//! RingTopo - Accelerator Ring Topology Election Daemon
//!
//! Runs the election coordinators of a simulated ring fabric and serves the
//! control surface of one of its hosts over HTTP.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringtopo::api::HttpServer;
use ringtopo::config::{LoggingConfig, RingTopoConfig};
use ringtopo::error::Result;
use ringtopo::hal::{DeviceHal, SimFabric};
use ringtopo::topology::{ElectionCoordinator, ElectionHandle};

/// RingTopo - Accelerator Ring Topology Election Daemon
#[derive(Parser)]
#[command(name = "ringtopod")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ringtopo.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the election daemon
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ringtopo.toml")]
        output: PathBuf,

        /// Hosts in the simulated ring (2 or 4)
        #[arg(long, default_value_t = 4)]
        hosts: usize,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = RingTopoConfig::from_file(&cli.config)?;
            init_logging(&config.logging, cli.log_level.as_deref());
            run_start(config).await
        }
        Commands::Init { output, hosts } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_init(&output, hosts)
        }
        Commands::Validate => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_validate(&cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let level = level.unwrap_or(&logging.level).to_string();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the daemon
async fn run_start(config: RingTopoConfig) -> Result<()> {
    tracing::info!(
        "Starting ringtopod: {}-host ring, {} devices per host, serving host {}",
        config.sim.hosts,
        config.sim.members,
        config.host.index
    );

    let mut builder = SimFabric::builder()
        .hosts(config.sim.hosts)
        .members(config.sim.members)
        .seed(config.sim.serial_seed);
    if let Some(dir) = &config.sim.backing_dir {
        builder = builder.backing_dir(dir);
    }
    let fabric = builder.build()?;

    // Every simulated host needs its coordinator or the ring cannot agree.
    let mut handles: Vec<ElectionHandle> = Vec::with_capacity(fabric.host_count());
    let mut tasks = Vec::with_capacity(fabric.host_count());
    for host in 0..fabric.host_count() {
        let hal = fabric.host(host);
        tracing::info!(
            "{}: {} hardware, {} devices",
            hal.host_label(),
            hal.generation(),
            hal.member_count()
        );
        let (handle, task) = ElectionCoordinator::spawn(hal, config.election.clone())?;
        handles.push(handle);
        tasks.push(task);
    }

    let shutdown = CancellationToken::new();
    let server = HttpServer::new(
        config.api.clone(),
        format!("sim-host{}", config.host.index),
        handles[config.host.index].clone(),
    );
    let server_shutdown = shutdown.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = server.start(async move { server_shutdown.cancelled().await }).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    for handle in &handles {
        if let Err(e) = handle.shutdown().await {
            tracing::warn!("Coordinator shutdown: {}", e);
        }
    }
    for task in tasks {
        let _ = task.await;
    }
    let _ = api_task.await;

    fabric.flush()?;
    tracing::info!("ringtopod stopped");
    Ok(())
}

/// Write a sample configuration file
fn run_init(output: &Path, hosts: usize) -> Result<()> {
    let mut config = RingTopoConfig::sample();
    config.sim.hosts = hosts;
    config.validate()?;

    let content = toml::to_string_pretty(&config)
        .map_err(|e| ringtopo::Error::Config(format!("cannot render configuration: {}", e)))?;
    std::fs::write(output, format!("# RingTopo Configuration\n# Generated configuration file\n\n{}", content))?;

    println!("Configuration file created: {}", output.display());
    println!("Then start with: ringtopod --config {} start", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: &Path) -> Result<()> {
    match RingTopoConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Ring: {} hosts x {} devices", config.sim.hosts, config.sim.members);
            println!("  Served host: {}", config.host.index);
            println!("  Election timeout: {}s", config.election.timeout_secs);
            println!("  Flags: {:#04x}", config.election.flags.0);
            if config.api.enabled {
                println!("  API: {}", config.api.bind_address);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
