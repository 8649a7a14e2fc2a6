/*
* vm-mem-balancer command line
* ----------------------------
*
* vm-mem-balancer
* ├── serve [--port]                           run the daemon
* ├── init [--force]                           write config/default.toml
* └── plan --snapshot <file> [--free <bytes>]  show what the planner would do
*
* `plan` reads a JSON host snapshot:
*   { "free_memory": 104857600,
*     "domains": [ { "id": 1, "memory_actual": ..., "memory_maximum": ...,
*                    "mem_used": ..., "meminfo": { "used": ... } } ] }
* and prints the balance plan (or, with --balloon, the balloon plan).
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::api::{balloon_socket, create_router, middleware::MeminfoLimiter, AppState};
use crate::config::Settings;
use crate::core::planner::{self, MemsetRequest, PlannerParams};
use crate::core::{DomainState, Registry, SystemState};
use crate::hypervisor::Backends;
use crate::monitoring::spawn_periodic_balance;
use crate::utils::{format_bytes, logging};
use crate::AsyncMutex;

#[derive(Parser)]
#[command(name = "vm-mem-balancer")]
#[command(about = "Dynamic guest memory balancer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the balancing daemon
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
    /// Print the plan for a host snapshot without touching anything
    Plan {
        #[arg(short, long, value_name = "FILE")]
        snapshot: PathBuf,
        /// Override the snapshot's free memory, in bytes
        #[arg(long)]
        free: Option<u64>,
        /// Plan a balloon request of this many bytes instead of a balance pass
        #[arg(long)]
        balloon: Option<u64>,
    },
}

#[derive(Debug, Deserialize)]
pub struct Snapshot {
    pub free_memory: u64,
    pub domains: Vec<DomainState>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path),
        None => Settings::new(),
    }
    .context("failed to load configuration")?;
    logging::init(&settings.logging)?;

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.server.port);
            run_server(settings, port).await
        }
        Commands::Plan {
            snapshot,
            free,
            balloon,
        } => handle_plan_command(&settings, &snapshot, free, balloon),
        Commands::Init { .. } => Ok(()),
    }
}

pub async fn run_server(settings: Settings, port: u16) -> Result<()> {
    let backends = Backends::from_settings(&settings.hypervisor);
    let mut state =
        SystemState::new(&settings, backends).context("failed to initialise balancer")?;
    let adopted = state
        .adopt_running_domains()
        .context("failed to list running domains")?;
    info!("Tracking {} running domains", adopted);
    state.balance().await;
    let state = Arc::new(AsyncMutex::new(state));

    if settings.balancer.periodic_interval_secs > 0 {
        spawn_periodic_balance(
            state.clone(),
            std::time::Duration::from_secs(settings.balancer.periodic_interval_secs),
        );
    }

    if let Some(path) = &settings.server.balloon_socket {
        let listener = balloon_socket::bind(path)
            .with_context(|| format!("failed to bind balloon socket {}", path.display()))?;
        let hold = std::time::Duration::from_secs(settings.server.balloon_hold_secs);
        let socket_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = balloon_socket::serve(listener, socket_state, hold).await {
                error!("Balloon socket stopped: {}", e);
            }
        });
    }

    let app_state = AppState::new(state, MeminfoLimiter::from_settings(&settings.ingest));
    let app = create_router(app_state, &settings.server.api_prefix);

    let addr = format!("{}:{}", settings.server.host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

fn handle_init_command(force: bool) -> Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        println!(
            "{} {} already exists. Use --force to overwrite.",
            "✗".red(),
            target.display()
        );
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let config_str = toml::to_string_pretty(&Settings::default())?;
    std::fs::write(&target, config_str)
        .with_context(|| format!("failed to write {}", target.display()))?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}

fn handle_plan_command(
    settings: &Settings,
    snapshot: &Path,
    free: Option<u64>,
    balloon: Option<u64>,
) -> Result<()> {
    let raw = std::fs::read_to_string(snapshot)
        .with_context(|| format!("failed to read {}", snapshot.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&raw).context("invalid snapshot")?;
    let free = free.unwrap_or(snapshot.free_memory);

    let registry: Registry = snapshot.domains.into_iter().collect();
    let params = PlannerParams::from(&settings.planner);
    let requests = plan(settings, &registry, &params, free, balloon);

    println!("{}", "Planned targets:".bold());
    if requests.is_empty() {
        println!("  (nothing to do)");
    }
    for rq in &requests {
        let actual = registry.get(rq.domid).and_then(|d| d.memory_actual);
        let direction = match actual {
            Some(actual) if rq.target < actual => "shrink".red(),
            Some(actual) if rq.target > actual => "grow".green(),
            _ => "set".yellow(),
        };
        println!(
            "- domain {:>4}: {} -> {} ({})",
            rq.domid,
            actual.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            format_bytes(rq.target),
            direction
        );
    }
    Ok(())
}

fn plan(
    settings: &Settings,
    registry: &Registry,
    params: &PlannerParams,
    free: u64,
    balloon: Option<u64>,
) -> Vec<MemsetRequest> {
    let buffer = settings.balancer.free_mem_left();
    match balloon {
        Some(amount) => {
            let need = amount.saturating_add(buffer).saturating_sub(free);
            planner::balloon(need, registry, params)
        }
        None => {
            let delta = free as i128 - buffer as i128;
            let delta = delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64;
            planner::balance(delta, registry, params)
        }
    }
}
