mod api;
mod client;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use havoc_core::{ExperimentStatus, StressCommand};
use havoc_executor::StressAttack;
use havoc_logging::init_logger;
use havoc_scheduler::AttackScheduler;
use havoc_store::SqliteStore;

use api::AppState;
use client::{format_experiments, Client};
use config::Config;

#[derive(Parser)]
#[command(name = "havoc")]
#[command(about = "havoc - host-level fault injection agent")]
#[command(version)]
struct Cli {
    /// Address of a running havoc daemon (defaults to the configured bind/port)
    #[arg(long, global = true, env = "HAVOC_URL")]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent daemon with its HTTP API
    Serve {
        /// Port to bind the HTTP server to
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind the HTTP server to
        #[arg(long)]
        bind: Option<String>,
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,
    },
    /// Launch an attack
    #[command(subcommand)]
    Attack(AttackCommands),
    /// Recover an attack before it finishes on its own
    Recover {
        uid: Uuid,
    },
    /// List experiments
    Search {
        /// Only show experiments in this status
        #[arg(long)]
        status: Option<ExperimentStatus>,
        /// Show a single experiment
        #[arg(long, conflicts_with = "status")]
        uid: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum AttackCommands {
    /// Stress CPU or memory with stress-ng
    Stress(StressArgs),
}

#[derive(Args)]
struct StressArgs {
    /// cpu or mem
    #[arg(short, long)]
    action: String,
    /// CPU load percentage per worker
    #[arg(short, long, default_value_t = 10)]
    load: u32,
    /// Number of stressor workers
    #[arg(short, long, default_value_t = 1)]
    workers: u32,
    /// Memory per worker, e.g. 256M
    #[arg(short, long)]
    size: Option<String>,
    /// Extra stress-ng flags, repeatable
    #[arg(short = 'o', long = "option", allow_hyphen_values = true)]
    options: Vec<String>,
    /// Seconds each active phase lasts
    #[arg(long, default_value_t = 30)]
    duration: u64,
    /// Seconds between active phases; 0 runs once
    #[arg(long, default_value_t = 0)]
    cron_interval: u64,
}

impl From<StressArgs> for StressCommand {
    fn from(args: StressArgs) -> Self {
        StressCommand {
            action: args.action,
            load: args.load,
            workers: args.workers,
            size: args.size,
            options: args.options,
            duration_secs: args.duration,
            cron_interval_secs: args.cron_interval,
            pid: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, bind, db } => {
            let config = Config {
                port: port.unwrap_or(config.port),
                bind_address: bind.unwrap_or(config.bind_address),
                db_path: db.unwrap_or(config.db_path),
                ..config
            };
            init_logger(config.log_dir.as_deref().map(Path::new), &config.log_level);
            run_server(config).await?;
        }
        command => {
            init_logger(None, "warn");
            let client = Client::new(cli.server.unwrap_or_else(|| config.server_url()));
            run_client(&client, command).await?;
        }
    }

    Ok(())
}

async fn run_client(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Attack(AttackCommands::Stress(args)) => {
            let uid = client.stress(&args.into()).await?;
            println!("Attack stress successfully, uid: {uid}");
        }
        Commands::Recover { uid } => {
            client.recover(&uid).await?;
            println!("Recover {uid} successfully");
        }
        Commands::Search { status, uid } => {
            let experiments = match uid {
                Some(uid) => vec![client.get(&uid).await?],
                None => client.list(status.map(|s| s.as_str())).await?,
            };
            print!("{}", format_experiments(&experiments));
        }
        Commands::Serve { .. } => unreachable!("serve is handled by main"),
    }
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        port = config.port,
        bind = %config.bind_address,
        db = %config.db_path,
        stress_bin = %config.stress_bin,
        "Starting havoc agent"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("failed to open experiment store {}", config.db_path))?;
    let scheduler = AttackScheduler::new(
        Arc::new(store),
        StressAttack::with_binary(&config.stress_bin),
        config.wheel_config(),
    );
    scheduler.start();

    let app_state = Arc::new(AppState {
        scheduler: scheduler.clone(),
    });
    let app = api::build_router(app_state).layer(TraceLayer::new_for_http());
    let addr = format!("{}:{}", config.bind_address, config.port);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    info!("havoc agent stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, revoking active experiments");
}
