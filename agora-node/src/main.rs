use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use agora_api::ApiState;
use agora_engine::{EconomyNode, Settings};

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Agora agent economy node")]
struct Cli {
    /// Path to a config file; defaults to ./agora.{toml,yaml,json}
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all five services and the schedulers
    Start,
    /// Create the database schema and exit
    InitDb,
    /// Print the ledger conservation audit and exit
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Start => start(settings).await,
        Commands::InitDb => {
            EconomyNode::new(settings).await?;
            info!("database initialized");
            Ok(())
        }
        Commands::Audit => {
            let node = EconomyNode::new(settings).await?;
            let audit = node.bank().audit().await?;
            println!(
                "credits {} | escrow payouts {} | escrow locks {} | spendable {} | locked {} | consistent: {}",
                audit.credits,
                audit.escrow_payouts,
                audit.escrow_locks,
                audit.spendable,
                audit.locked_outstanding,
                audit.consistent
            );
            Ok(())
        }
    }
}

async fn start(settings: Settings) -> anyhow::Result<()> {
    let ports = settings.ports.clone();
    let node = Arc::new(EconomyNode::new(settings).await?);
    let state = ApiState::new(node.clone());

    tokio::spawn(node.sweeper().run());
    tokio::spawn(node.salary_scheduler().run());

    let servers = [
        tokio::spawn(agora_api::serve(
            agora_api::identity_router(state.clone()),
            ports.identity,
        )),
        tokio::spawn(agora_api::serve(
            agora_api::bank_router(state.clone()),
            ports.bank,
        )),
        tokio::spawn(agora_api::serve(
            agora_api::board_router(state.clone()),
            ports.board,
        )),
        tokio::spawn(agora_api::serve(
            agora_api::reputation_router(state.clone()),
            ports.reputation,
        )),
        tokio::spawn(agora_api::serve(
            agora_api::court_router(state.clone()),
            ports.court,
        )),
    ];

    info!(
        identity = ports.identity,
        bank = ports.bank,
        board = ports.board,
        reputation = ports.reputation,
        court = ports.court,
        "agora node running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    for server in servers {
        server.abort();
    }
    Ok(())
}
