use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::AgentConfig;
use pool_agent::sim::{
    SimClock, SimDocStore, SimExecutor, SimLanguageModel, SimMarketProvider, SimVectorIndex,
};
use pool_agent::{AgentService, Collaborators};
use types::{PoolId, TokenPair};

#[derive(Parser, Debug)]
#[command(name = "pool_agent", about = "Memory-driven LP yield agent")]
struct Args {
    /// Path to the agent TOML configuration.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match AgentConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration rejected: {e:#}");
            return ExitCode::from(2);
        }
    };

    // The binary is the demonstrator: it runs against the in-process
    // simulated collaborators. Production deployments embed the library
    // and wire real backends through `Collaborators`.
    warn!("running with simulated collaborators (dry run, no real funds)");

    let clock = Arc::new(SimClock::at(chrono::Utc::now()));
    let provider = Arc::new(SimMarketProvider::with_clock(clock.clone()));
    seed_demo_market(&provider);

    let executor = Arc::new(SimExecutor::with_clock(clock.clone()));
    let collaborators = Collaborators {
        provider,
        executor,
        vector_index: Arc::new(SimVectorIndex::new()),
        doc_store: Arc::new(SimDocStore::new()),
        llm: Some(Arc::new(SimLanguageModel::new())),
        clock,
    };

    let service = AgentService::new(config, collaborators);
    let cancel = service.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping at next suspension point");
            cancel.cancel();
        }
    });

    match service.run().await {
        Ok(code) => {
            info!(code, "agent stopped");
            ExitCode::from(code as u8)
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

/// A small Base-flavored pool universe for the dry run.
fn seed_demo_market(provider: &SimMarketProvider) {
    provider.add_pool(
        PoolId::from("weth-usdc"),
        TokenPair::new("WETH", "USDC"),
        dec!(18.5),
        dec!(12.1),
        dec!(6.4),
        dec!(8200000),
        dec!(2400000),
    );
    provider.add_pool(
        PoolId::from("aero-usdc"),
        TokenPair::new("AERO", "USDC"),
        dec!(31.0),
        dec!(9.2),
        dec!(21.8),
        dec!(1900000),
        dec!(610000),
    );
    provider.add_pool(
        PoolId::from("aero-weth"),
        TokenPair::new("AERO", "WETH"),
        dec!(44.2),
        dec!(13.0),
        dec!(31.2),
        dec!(720000),
        dec!(280000),
    );
    provider.set_gas_gwei(dec!(14));
}
