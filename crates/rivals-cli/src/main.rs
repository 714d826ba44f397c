use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rivals_storage::{NewUser, Store};
use rivals_sync::{SyncConfig, SyncOrchestrator};
use rivals_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "rivals-cli")]
#[command(about = "Sync start.gg history and query head-to-head records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Register (or update) a user with linked start.gg credentials.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        remote_id: i64,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, env = "STARTGG_ACCESS_TOKEN")]
        token: String,
    },
    /// Run a full sync for one user in the foreground.
    Sync { user_id: i64 },
    /// Show the sync state for one user.
    Status { user_id: i64 },
    /// Print win/loss totals and per-opponent records.
    Records { user_id: i64 },
    /// Serve the JSON surface (and the scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;

    match cli.command {
        Commands::Migrate => {
            println!("migrations applied");
        }
        Commands::Register {
            email,
            remote_id,
            tag,
            token,
        } => {
            let user = store
                .register_user(&NewUser {
                    email,
                    remote_id: Some(remote_id),
                    tag,
                    access_token: Some(token),
                })
                .await
                .context("registering user")?;
            println!("registered user id={} tag={}", user.id, user.display_tag());
        }
        Commands::Sync { user_id } => {
            let orchestrator = build_orchestrator(store, &config)?;
            let report = orchestrator
                .sync_now(user_id)
                .await
                .with_context(|| format!("syncing user {user_id}"))?;
            println!(
                "sync {}: run_id={} tournaments={} events={} matches={}",
                report.status,
                report.run_id,
                report.counts.tournaments,
                report.counts.events,
                report.counts.matches
            );
            println!("{}", report.message);
        }
        Commands::Status { user_id } => {
            let orchestrator = build_orchestrator(store, &config)?;
            let view = orchestrator
                .status(user_id)
                .await
                .with_context(|| format!("loading sync state for user {user_id}"))?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Records { user_id } => {
            if store.user_by_id(user_id).await?.is_none() {
                bail!("unknown user {user_id}");
            }
            let totals = store.win_loss(user_id).await?;
            println!("overall: {}-{}", totals.wins, totals.losses);
            for record in store.head_to_head(user_id).await? {
                println!(
                    "{:>4}-{:<4} {} (user {})",
                    record.wins, record.losses, record.opponent_tag, record.opponent_user_id
                );
            }
        }
        Commands::Serve => {
            let orchestrator = build_orchestrator(store, &config)?;
            let scheduler = orchestrator.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduled sync enabled");
            } else {
                warn!("scheduled sync disabled; set RIVALS_SCHEDULER_ENABLED=true to enable");
            }
            rivals_web::serve(AppState::new(orchestrator), config.web_port).await?;
        }
    }

    Ok(())
}

fn build_orchestrator(store: Store, config: &SyncConfig) -> Result<SyncOrchestrator> {
    let client = config.build_client()?;
    Ok(SyncOrchestrator::new(store, Arc::new(client), config.clone()))
}
