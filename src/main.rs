//! csmr - collaborative state machine runtime
//!
//! Runs state machine instances on one node, connected to other nodes
//! through the event router.

use clap::{Parser, Subcommand};
use colored::Colorize;
use csmr_coord::LocalCoordinator;
use csmr_core::Model;
use csmr_router::{EventRouter, PeerConfig, PeerLink, RouterConfig, RouterServer, RouterServerConfig};
use csmr_runtime::{Config, Metrics, MetricsServer, Runtime, ServiceRegistry, StatusFn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csmr")]
#[command(about = "Collaborative state machine runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check machine descriptions without running them
    Validate {
        /// Description files (YAML or JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write a Graphviz rendering of each valid model next to its file
        #[arg(long)]
        dot: bool,
    },
    /// Run instances of the given machine descriptions on this node
    Run {
        /// Description files (YAML or JSON)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Configuration file (defaults to $CSMR_CONFIG)
        #[arg(short, long, env = "CSMR_CONFIG")]
        config: Option<PathBuf>,

        /// Node id, overriding the configuration
        #[arg(long)]
        node_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { files, dot } => validate(&files, dot),
        Command::Run {
            files,
            config,
            node_id,
        } => run(&files, config, node_id).await,
    }
}

fn load_model(path: &Path) -> Result<Model, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    Ok(Model::from_yaml(&text)?)
}

fn validate(files: &[PathBuf], dot: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut failed = 0;
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                println!("{} {}: {}", "ERROR".red().bold(), path.display(), e);
                failed += 1;
                continue;
            }
        };
        match Model::from_yaml(&text) {
            Ok(model) => {
                println!(
                    "{} {} ({}, {} states)",
                    "OK".green().bold(),
                    path.display(),
                    model.model_version(),
                    model.states().count()
                );
                if dot {
                    let target = path.with_extension("dot");
                    std::fs::write(&target, csmr_core::to_dot(&model))
                        .map_err(|e| format!("{}: {}", target.display(), e))?;
                    println!("  {} {}", "->".dimmed(), target.display());
                }
            }
            Err(e) => {
                failed += 1;
                println!("{} {}: model '{}'", "INVALID".red().bold(), path.display(), e.model);
                for violation in &e.violations {
                    println!("  {} {}", "-".dimmed(), violation);
                }
            }
        }
    }
    if failed > 0 {
        return Err(format!("{} of {} description(s) invalid", failed, files.len()).into());
    }
    Ok(())
}

async fn run(
    files: &[PathBuf],
    config_path: Option<PathBuf>,
    node_id: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &config_path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => Config::from_env(),
    };
    if let Some(node_id) = node_id {
        config.node.node_id = node_id;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.node.log_level)),
        )
        .init();

    if let Some(path) = &config_path {
        tracing::info!("Loaded config from {}", path.display());
    }

    // Parse every description before touching the network.
    let mut models = Vec::with_capacity(files.len());
    for path in files {
        let model = load_model(path)?;
        tracing::info!("Loaded {} from {}", model.model_version(), path.display());
        models.push(Arc::new(model));
    }

    let node = config.node.node_id.clone();
    tracing::info!("Starting csmr node {}", node);

    let metrics = Arc::new(Metrics::new()?);

    let router = Arc::new(EventRouter::new(
        RouterConfig::new(node.clone())
            .with_inbox_capacity(config.router.inbox_capacity)
            .with_retry(config.router.retry_policy()),
    ));
    for addr in &config.router.peers {
        let link = PeerLink::new(
            PeerConfig::new(addr.clone(), node.clone())
                .with_connect_timeout(config.router.connect_timeout())
                .with_ack_timeout(config.router.ack_timeout()),
        );
        router.add_peer(addr, Arc::new(link));
        tracing::info!("  Peer: {}", addr);
    }

    let server = if config.router.listen {
        let server_config = RouterServerConfig {
            bind_addr: config.router.bind_addr,
            idle_timeout: config.router.idle_timeout(),
            max_connections: config.router.max_connections,
        };
        let server = Arc::new(RouterServer::bind(server_config, router.clone()).await?);
        let running = server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = running.run().await {
                tracing::error!("Router server error: {}", e);
            }
        });
        Some((server, handle))
    } else {
        tracing::info!("  Router listener: disabled");
        None
    };

    // One coordinator per process; the session is this node's membership.
    let coordinator = LocalCoordinator::new();
    let reaper = coordinator.spawn_reaper(config.coordination.reaper_interval());
    let session = Arc::new(coordinator.open_session(node.clone(), config.coordination.session_timeout()));
    let keepalive = session.spawn_keepalive(config.coordination.heartbeat_interval());

    let runtime = Arc::new(Runtime::new(
        config.clone(),
        router.clone(),
        session.clone(),
        Arc::new(ServiceRegistry::new()),
        metrics.clone(),
    )?);

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let server = MetricsServer::bind(config.metrics.bind_addr).await?;
        tracing::info!("  Metrics: http://{}/metrics", server.local_addr()?);
        let status_runtime = runtime.clone();
        let status: StatusFn = Arc::new(move || status_runtime.status_json());
        Some(tokio::spawn(server.run(metrics.clone(), status, metrics_shutdown.subscribe())))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    for model in models {
        let instance_id = runtime.spawn(model)?;
        tracing::info!("  Instance: {}", instance_id);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping node...");

    runtime.shutdown();
    runtime.join().await;

    if let Some((server, handle)) = server {
        server.shutdown();
        let _ = handle.await;
    }
    router.shutdown();

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    keepalive.abort();
    session.close();
    reaper.abort();

    tracing::info!("Node stopped");
    Ok(())
}
