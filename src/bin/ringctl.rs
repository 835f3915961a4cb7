//! RingCtl - Command line tool for the ring topology election daemon
//!
//! Usage:
//!   ringctl status            - Show election status of the served host
//!   ringctl elect             - Request a new election
//!   ringctl kill              - Cancel the running election
//!   ringctl mode half-a       - Lock in an operating mode
//!   ringctl attrs             - Show node id, ring serial and modes

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use ringtopo::api::ModeRequest;
use ringtopo::config::RingTopoConfig;
use ringtopo::topology::{Attributes, OperatingMode, RingTopology, StatusReport};

/// Ring Topology Control Tool
#[derive(Parser)]
#[command(name = "ringctl")]
#[command(about = "Control and monitor accelerator ring topology election", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/ringtopo/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show election status
    Status,
    /// Request a new election
    Elect,
    /// Cancel a running election
    Kill,
    /// Lock in an operating mode (full-ring, half-a, half-b, single)
    Mode {
        mode: OperatingMode,
    },
    /// Switch to single-node operation
    SingleNode,
    /// Show read-only attributes
    Attrs,
    /// Show the raw elected ring
    Topology,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    errno: i32,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = cli.endpoint.clone().unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Elect => control(&client, &endpoint, "/election", None).await,
        Commands::Kill => control(&client, &endpoint, "/election/kill", None).await,
        Commands::Mode { mode } => control(&client, &endpoint, "/mode", Some(*mode)).await,
        Commands::SingleNode => control(&client, &endpoint, "/single-node", None).await,
        Commands::Attrs => show_attributes(&client, &endpoint).await,
        Commands::Topology => show_topology(&client, &endpoint).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, falling back to the default bind address
fn endpoint_from_config(path: &PathBuf) -> String {
    let addr = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<RingTopoConfig>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(|| "127.0.0.1:8090".to_string());

    // Convert bind address to localhost if it's 0.0.0.0
    if let Some(port) = addr.strip_prefix("0.0.0.0:") {
        format!("http://127.0.0.1:{}", port)
    } else {
        format!("http://{}", addr)
    }
}

async fn check_response(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => bail!("{} (errno {}, HTTP {})", body.error, body.errno, status),
        Err(_) => bail!("API error: {}", status),
    }
}

fn print_status(status: &StatusReport) {
    println!();
    println!("Election Status");
    println!("===============");
    println!();
    println!("State:   {}", status.state);
    match status.node_id {
        Some(id) => println!("Node ID: {}", id),
        None => println!("Node ID: unassigned"),
    }
    println!("Since:   {}", status.since.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/status", endpoint))
        .send()
        .await
        .with_context(|| format!("cannot reach {}", endpoint))?;
    let status: StatusReport = check_response(response).await?.json().await?;
    print_status(&status);
    Ok(())
}

async fn control(
    client: &reqwest::Client,
    endpoint: &str,
    path: &str,
    mode: Option<OperatingMode>,
) -> anyhow::Result<()> {
    let mut request = client.post(format!("{}{}", endpoint, path));
    if let Some(mode) = mode {
        request = request.json(&ModeRequest { mode });
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("cannot reach {}", endpoint))?;
    let status: StatusReport = check_response(response).await?.json().await?;
    print_status(&status);
    Ok(())
}

async fn show_attributes(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/attributes", endpoint))
        .send()
        .await
        .with_context(|| format!("cannot reach {}", endpoint))?;
    let attrs: Attributes = check_response(response).await?.json().await?;

    println!("node_id:         {}", attrs.node_id);
    println!("serial:          {}", attrs.serial);
    println!("supported_modes: {}", attrs.supported_modes);
    Ok(())
}

async fn show_topology(client: &reqwest::Client, endpoint: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/topology", endpoint))
        .send()
        .await
        .with_context(|| format!("cannot reach {}", endpoint))?;
    let topology: Option<RingTopology> = check_response(response).await?.json().await?;

    let Some(topology) = topology else {
        println!("No ring elected");
        return Ok(());
    };

    println!();
    println!("Ring Topology");
    println!("=============");
    println!();
    println!("Links:     {}", topology.link_mask);
    println!("Ring size: {}", topology.ring_size);
    println!("Node ID:   {}", topology.node_id);
    println!("Canonical: {:016x}", topology.canonical);
    println!();
    println!("{:<8} {:<18}", "NODE", "SERIAL");
    println!("{}", "-".repeat(27));
    for (id, serial) in topology.members.iter().enumerate() {
        let marker = if *serial == topology.serial { " *" } else { "" };
        println!("{:<8} {:016x}{}", id, serial, marker);
    }
    println!();
    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    let config = RingTopoConfig::from_file(path)
        .with_context(|| format!("configuration {} is invalid", path.display()))?;

    println!("✓ Configuration is valid: {}", path.display());
    println!("  Ring:             {} hosts x {} devices", config.sim.hosts, config.sim.members);
    println!("  Served host:      {}", config.host.index);
    println!("  Election timeout: {}s", config.election.timeout_secs);
    println!("  Retry floor:      {}s", config.election.retry_floor_secs);

    let flags = config.election.flags;
    let mut names = Vec::new();
    if flags.skip_at_load() {
        names.push("skip-at-load");
    }
    if flags.verbose() {
        names.push("verbose");
    }
    if !flags.faulted_links().is_empty() {
        names.push("link-fault");
    }
    if flags.single_link() {
        names.push("single-link");
    }
    if flags.clear_state() {
        names.push("clear-state");
    }
    println!("  Flags:            {:#04x} [{}]", flags.0, names.join(", "));
    Ok(())
}
