//! attguard daemon entry point.
//!
//! `serve` runs the daemon, `inspect` summarises a snapshot file and
//! `check-config` prints the effective configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use attguard::config::AttguardConfig;
use attguard::dispatch::Dispatcher;
use attguard::policy::http::HttpPolicyClient;
use attguard::policy::PolicyClient;
use attguard::ports::{LocalPortKernel, PortKernel};
use attguard::registry::entities::{parse_id, Principal};
use attguard::registry::{Registry, RegistryOptions, Snapshot};
use attguard::server::Server;

/// Attestation daemon for locally registered principals.
#[derive(Parser)]
#[command(name = "attguard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Serve {
        /// Config file; falls back to `$ATTGUARD_CONFIG_PATH`, then `./attguard.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarise a snapshot file.
    Inspect {
        /// Snapshot to read.
        snapshot: PathBuf,
    },
    /// Print the effective configuration as TOML.
    CheckConfig {
        /// Config file; falls back to `$ATTGUARD_CONFIG_PATH`, then `./attguard.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => handle_serve(config.as_deref()).await,
        Command::Inspect { snapshot } => {
            attguard::logging::init_cli("warn");
            handle_inspect(&snapshot)
        }
        Command::CheckConfig { config } => {
            attguard::logging::init_cli("info");
            handle_check_config(config.as_deref())
        }
    }
}

async fn handle_serve(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = AttguardConfig::load(config_path)?;

    let _logging_guard = match &config.logging.dir {
        Some(dir) => Some(attguard::logging::init_production(dir, &config.logging.level)?),
        None => {
            attguard::logging::init_cli(&config.logging.level);
            None
        }
    };

    let local = config
        .ports
        .range()
        .context("[ports] local_lo must be below local_hi")?;
    let kernel: Arc<dyn PortKernel> = Arc::new(LocalPortKernel::new(local));
    let policy: Arc<dyn PolicyClient> =
        Arc::new(HttpPolicyClient::new(&config.policy).context("failed to build policy client")?);

    let (registry, report) =
        Registry::from_disk(RegistryOptions::from_config(&config), kernel, Arc::clone(&policy))
            .context("failed to initialise registry")?;
    if !report.conflicts.is_empty() {
        warn!(conflicts = ?report.conflicts, "some principals could not be restored");
    }
    let registry = Arc::new(registry);
    registry.start_sync();

    let dispatcher = Arc::new(Dispatcher::new(&config, policy, Arc::clone(&registry)));
    let server = Server::bind(&config.server, dispatcher)
        .with_context(|| format!("failed to bind {}", config.server.socket_path.display()))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = tokio::spawn(server.run(shutdown_rx));

    info!(
        speaker = %config.identity.speaker,
        policy = %config.policy.url,
        lo = local.lo,
        hi = local.hi,
        "attguard started"
    );

    wait_for_signal().await;
    info!("received shutdown signal, stopping");

    let _ = shutdown_tx.send(true);
    if let Err(err) = listener.await {
        warn!(error = %err, "listener task failed");
    }
    registry.stop().await;

    info!("attguard stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "SIGTERM handler unavailable, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn handle_inspect(path: &Path) -> anyhow::Result<()> {
    let snapshot = Snapshot::load(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .with_context(|| format!("{} does not exist", path.display()))?;

    println!("snapshot: {}", path.display());
    println!("principals: {}", snapshot.principals.len());
    println!("images:     {}", snapshot.images.len());
    println!("accessors:  {}", snapshot.accessors.len());

    for (key, value) in &snapshot.principals {
        match Principal::from_entry(value) {
            Ok(p) => println!("  {key}  ip={} ports={} image={}", p.ip, p.ports, p.image),
            Err(err) => {
                let id = parse_id(key).map(|id| id.to_string()).unwrap_or_else(|_| key.clone());
                println!("  {id}  <unreadable: {err}>");
            }
        }
    }
    Ok(())
}

fn handle_check_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = AttguardConfig::load(config_path)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
    println!("{rendered}");
    Ok(())
}
