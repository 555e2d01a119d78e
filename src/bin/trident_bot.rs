//! Trident CLI shell: load configuration, wire the coordinator, run until
//! an operator interrupt. Exit codes: 0 normal, 1 config error, 2 schema
//! incompatible, 3 signer failure, 4 irrecoverable chain failure, 130
//! operator interrupt.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use trident_core::config::BotConfig;
use trident_core::coordinator::Coordinator;
use trident_core::error::BotError;
use trident_core::types::{RiskScope, StrategyKind};

#[derive(Parser, Debug)]
#[command(
    name = "trident_bot",
    about = "Multi-strategy trading core (arbitrage / sandwich / copy)"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "trident.toml")]
    config: PathBuf,

    /// Validate configuration and exit without trading.
    #[arg(long)]
    check_config: bool,

    /// Clear a persisted kill switch before starting:
    /// "global", "arbitrage", "sandwich" or "copy".
    #[arg(long)]
    reset_kill: Option<String>,

    /// Operator name recorded with --reset-kill.
    #[arg(long, default_value = "operator")]
    operator: String,
}

const EXIT_INTERRUPT: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match BotConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    info!("⚙️ configuration loaded from {}", cli.config.display());
    if cli.check_config {
        info!("configuration is valid");
        return ExitCode::SUCCESS;
    }

    let coordinator = match Coordinator::new(config) {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    if let Some(scope_name) = &cli.reset_kill {
        let scope = match scope_name.as_str() {
            "global" => RiskScope::Global,
            "arbitrage" => RiskScope::Strategy(StrategyKind::Arbitrage),
            "sandwich" => RiskScope::Strategy(StrategyKind::Sandwich),
            "copy" => RiskScope::Strategy(StrategyKind::Copy),
            other => {
                error!("unknown kill scope: {other}");
                return ExitCode::from(1);
            }
        };
        match coordinator.store().acknowledge_kills(&scope) {
            Ok(cleared) => info!(
                "🔓 {} cleared {cleared} persisted kill(s) for {}",
                cli.operator,
                scope.as_str()
            ),
            Err(e) => {
                error!("kill reset failed: {e}");
                return ExitCode::from(e.exit_code() as u8);
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn(coordinator.clone().run(shutdown_rx));

    let interrupted = tokio::signal::ctrl_c().await.is_ok();
    if interrupted {
        info!("⏸️ interrupt received; draining");
    }
    let _ = shutdown_tx.send(true);

    match runner.await {
        Ok(Ok(())) => {
            if interrupted {
                ExitCode::from(EXIT_INTERRUPT)
            } else {
                ExitCode::SUCCESS
            }
        }
        Ok(Err(e)) => {
            error!("coordinator failed: {e}");
            match e {
                BotError::SchemaIncompatible { .. } => ExitCode::from(2),
                BotError::Signer(_) => ExitCode::from(3),
                _ => ExitCode::from(4),
            }
        }
        Err(join_err) => {
            error!("coordinator task panicked: {join_err}");
            ExitCode::from(4)
        }
    }
}
