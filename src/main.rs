//! AI4All Cluster - distributed layer-pipelined inference node
//!
//! Entry point for the node binary: runs the backend service, previews
//! partitions and manages configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use ai4all_cluster::backend::MockLayerBackend;
use ai4all_cluster::cli::{Cli, Commands, ConfigSubcommand};
use ai4all_cluster::config::{self, ClusterConfig};
use ai4all_cluster::error::{Error, Result};
use ai4all_cluster::logging::{self, LogGuards};
use ai4all_cluster::partition::{Partition, Partitioner};
use ai4all_cluster::peer::PeerRegistry;
use ai4all_cluster::service::BackendService;
use ai4all_cluster::system::LocalResources;
use ai4all_cluster::types::{ModelProfile, NodeDescriptor};
use ai4all_cluster::version;

/// How often the running node logs its status
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    if let Err(e) = run_cli() {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run_cli() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Partition { model, config, json } => {
            logging::init_simple(if cli.verbose > 0 {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            })?;
            let config = ClusterConfig::load(config.as_deref())?;
            preview_partition(&config, Path::new(&model), json)
        }
        Commands::Run { config, no_participate } => {
            let mut config = ClusterConfig::load(config.as_deref())?;
            if no_participate {
                config.node.participate = false;
            }

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting AI4All cluster node"
            );
            run_node(config)
        }
    }
}

/// Initialize logging from configuration
fn init_logging_from_config(config: &ClusterConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

/// Run the node until Ctrl+C
fn run_node(config: ClusterConfig) -> Result<()> {
    info!(
        node_id = %config.node_id(),
        discovery = %config.discovery.mode,
        listen_port = config.node.listen_port,
        participate = config.node.participate,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(num_cpus::get().min(8))
        .thread_name("ai4all-cluster")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_node_main(config))
}

async fn async_node_main(config: ClusterConfig) -> Result<()> {
    let service = BackendService::builder(config)
        .local_backend(Arc::new(MockLayerBackend::new()))
        .build()?;
    service.start().await?;

    if let Some(address) = service.advertised_address() {
        info!(node_id = %service.node_id(), address = %address, "Node announced");
    }
    if service.models().is_empty() {
        warn!("No model profiles configured; requests will fail with ModelNotFound");
    }

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut status_timer = tokio::time::interval(STATUS_INTERVAL);
    status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Shutdown signal received");
                break;
            }
            _ = status_timer.tick() => {
                let status = service.status();
                let health = service.health();
                info!(
                    cluster_size = health.cluster_size,
                    cluster_version = status.cluster_version,
                    model_loaded = health.model_loaded,
                    active_requests = status.active_requests,
                    cached_responses = status.cached_responses,
                    "Node status"
                );
            }
        }
    }

    service.stop().await
}

/// Partition `model` over the statically known nodes and print it
fn preview_partition(config: &ClusterConfig, model: &Path, json: bool) -> Result<()> {
    config.validate()?;
    let profile = ModelProfile::load_from_file(model)?;

    let registry = PeerRegistry::default();
    if config.node.participate {
        let resources = LocalResources::probe_with(&config.node);
        let address = config
            .node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", resources.hostname, config.node.listen_port));
        registry.upsert(NodeDescriptor::new(
            config.node_id(),
            address,
            resources.free_memory_bytes,
            resources.compute_score,
        ));
    }

    let mut skipped = Vec::new();
    for peer in &config.discovery.peers {
        match peer.free_memory_bytes {
            Some(free_memory) => {
                registry.upsert(NodeDescriptor::new(
                    peer.id.clone(),
                    peer.socket_addr(),
                    free_memory,
                    peer.compute_score.unwrap_or(1.0),
                ));
            }
            None => skipped.push(peer.id.clone()),
        }
    }

    let partition = Partitioner::new().compute(&registry.snapshot(), &profile)?;

    if json {
        let rendered = serde_json::to_string_pretty(&partition)
            .map_err(|e| Error::Internal(format!("Failed to encode partition: {}", e)))?;
        println!("{}", rendered);
    } else {
        print_partition(&partition, &profile);
        if !skipped.is_empty() {
            println!();
            println!("Skipped (no free_memory_bytes): {}", skipped.join(", "));
        }
    }
    Ok(())
}

fn print_partition(partition: &Partition, profile: &ModelProfile) {
    println!(
        "Partition for {} ({} layers, {:.2} GiB)",
        partition.model_id,
        partition.total_layers,
        gib(profile.total_memory())
    );
    println!();
    println!("  {:<20} {:<24} {:>10} {:>10} {:>10}", "NODE", "ADDRESS", "LAYERS", "NEEDS", "FREE");
    for assignment in &partition.assignments {
        println!(
            "  {:<20} {:<24} {:>10} {:>8.2}Gi {:>8.2}Gi",
            assignment.node.id,
            assignment.node.address,
            assignment.layers.to_string(),
            gib(profile.memory_in(assignment.layers)),
            gib(assignment.node.free_memory_bytes),
        );
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1u64 << 30) as f64
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = ClusterConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate { config } => {
            ClusterConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
