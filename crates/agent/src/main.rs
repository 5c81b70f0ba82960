use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use svrn::cli::{version_line, Cli, Command};
use svrn::runtime::{boot, stop};
use svrn::state::AgentState;
use svrn::{conf, Agent, AgentError};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if matches!(cli.command, Some(Command::Version)) {
        println!("{}", version_line());
        return ExitCode::SUCCESS;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let error = format!("{:#}", e);
            error!(error = %error, "svrn exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    // Phase 1: thread-local tracing while the config is loaded.
    let basic_tracing = boot::init_tracing_basic();
    info!("Starting {}", version_line());

    let config = match conf::load(&cli, |key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(e) => {
            // Logged here: the global subscriber does not exist yet.
            error!(error = %e, "Failed to load configuration");
            return Ok(ExitCode::FAILURE);
        }
    };

    // Phase 2: free the thread-local slot, then install the configured subscriber.
    drop(basic_tracing);
    boot::init_tracing(config.logging()).context("Failed to install tracing subscriber")?;

    info!(
        "Configuration loaded: node={}, roles=[{}], services=[{}], router={}",
        config.node(),
        config.roles(),
        config.services().iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "),
        config.router()
    );

    let agent = Arc::new(Agent::with_defaults(config));

    let stopper = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move {
            stop::shutdown_signal().await;
            agent.stop().await
        })
    };

    match agent.start().await {
        Ok(()) => match serde_json::to_string(&agent.status()) {
            Ok(status) => info!(status = %status, "svrn is ready"),
            Err(e) => warn!("Could not encode status: {}", e),
        },
        Err(AgentError::Cancelled) => {
            info!("Startup cancelled by shutdown signal");
            return finish(stopper).await;
        }
        Err(e) => {
            stopper.abort();
            return Err(e).context("Failed to start agent");
        }
    }

    match agent.wait_for_exit().await {
        AgentState::Failed => {
            stopper.abort();
            error!("Agent failed at runtime, cleaning up");
            if let Err(e) = agent.stop().await {
                warn!("Cleanup after failure: {}", e);
            }
            Ok(ExitCode::FAILURE)
        }
        _ => finish(stopper).await,
    }
}

/// Collect the outcome of the signal-driven stop.
async fn finish(stopper: tokio::task::JoinHandle<Result<(), AgentError>>) -> Result<ExitCode> {
    match stopper.await.context("Shutdown task panicked")? {
        Ok(()) => {
            info!("svrn shut down gracefully");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            warn!("svrn shut down with errors: {}", e);
            Ok(ExitCode::SUCCESS)
        }
    }
}
