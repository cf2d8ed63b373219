use clap::{Parser, Subcommand};
use guardrail::config::AppConfig;
use guardrail::connection::ws;
use guardrail::error::Result;
use guardrail::services::CoreServices;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "guardrail", about = "Coordination core for multi-worker trading backends")]
struct Cli {
    /// Config file path (TOML); env vars GUARDRAIL__* override
    #[arg(long, default_value = "guardrail.toml", env = "GUARDRAIL_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker: heartbeat, orphan recovery, client connections
    Worker,
    /// One-shot orphan sweep, then exit
    Sweep,
    /// Show distributed lock state for an account
    LockInfo { account_id: String },
    /// Force-release a stuck account lock
    ForceUnlock { account_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker => {
            let config = AppConfig::load(&cli.config)?;
            init_logging(&config.logging.level);
            run_worker(config).await?;
        }
        Commands::Sweep => {
            let config = AppConfig::load(&cli.config)?;
            init_logging(&config.logging.level);
            run_sweep(config).await?;
        }
        Commands::LockInfo { account_id } => {
            init_logging_simple();
            let services = CoreServices::init(AppConfig::load(&cli.config)?).await?;
            let info = services.get_lock_info(&account_id).await;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::ForceUnlock { account_id } => {
            init_logging_simple();
            let services = CoreServices::init(AppConfig::load(&cli.config)?).await?;
            if services.force_unlock(&account_id).await {
                println!("Lock released for account {}", account_id);
            } else {
                println!("No lock held for account {}", account_id);
            }
        }
    }

    Ok(())
}

async fn run_worker(config: AppConfig) -> Result<()> {
    let services = CoreServices::init(config).await?;

    let orphans = services.start().await;
    info!(
        "Worker {} started ({} orphan(s) recovered)",
        services.registry.worker_id(),
        orphans.len()
    );

    let listener = services
        .config
        .connections
        .listen_addr
        .clone()
        .map(|addr| {
            let connections = services.connections.clone();
            tokio::spawn(async move {
                if let Err(e) = ws::serve(&addr, connections).await {
                    error!("Connection listener failed: {}", e);
                }
            })
        });

    shutdown_signal().await;
    warn!("Shutdown signal received, draining");

    if let Some(handle) = listener {
        handle.abort();
    }
    services.close().await;

    info!("Worker stopped cleanly");
    Ok(())
}

async fn run_sweep(config: AppConfig) -> Result<()> {
    let services = CoreServices::init(config).await?;

    let orphans = services.registry.sweep_orphans().await;
    for report in &orphans {
        services
            .alerts
            .orphaned_task(&report.task, report.age_secs)
            .await;
    }
    println!("Swept {} orphaned task(s)", orphans.len());
    Ok(())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},guardrail=debug", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn init_logging_simple() {
    // Minimal logging for admin commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
