//! jobsandbox - sandboxed job execution with an HTTP polling API.
//!
//! Usage:
//!   jobsandbox serve [--port 3004]                 # Start HTTP server
//!   jobsandbox run [--timeout 10] -- <command>     # Run one command and exit

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jobsandbox::config::{check_profile, SandboxArgs, ServeArgs, ServerConfig};
use jobsandbox::sandbox::{self, ExitOutcome};
use jobsandbox::scheduler::TaskScheduler;
use jobsandbox::shutdown::install_shutdown_handler;
use jobsandbox::state::AppState;
use jobsandbox::{http_server, metrics, sweeper};

const ROLLUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "jobsandbox")]
#[command(about = "Sandboxed job execution service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),

    /// Run one command in the sandbox and exit with its status
    Run {
        /// Wall-clock limit in seconds (0 = none)
        #[arg(long, default_value_t = 0)]
        timeout: u64,

        #[command(flatten)]
        sandbox: SandboxArgs,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Serve(args) => {
            serve(ServerConfig::from(args)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            timeout,
            sandbox,
            cmd,
        } => run_once(cmd, timeout, sandbox).await,
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    config.check_launch_mode()?;
    config.check_sandbox(nix::unistd::geteuid().is_root())?;
    if config.orchestrator_token.is_none() {
        warn!("CODEIA_ORCHESTRATOR_TOKEN is not set; protected routes will answer 503");
    }

    let state = AppState::new(config);
    let recovered = state.registry.recover(state.config.retention);
    info!(recovered, logs_dir = ?state.config.logs_dir, "Task registry ready");

    let shutdown = install_shutdown_handler().context("installing signal handlers")?;
    let sweeper = sweeper::spawn(
        Arc::clone(&state.registry),
        state.config.retention,
        state.config.sweep_interval,
        shutdown.clone(),
    );

    let scheduler = TaskScheduler::start().context("starting scheduler thread")?;
    let registry = Arc::clone(&state.registry);
    scheduler.schedule_recurring("registry-rollup", ROLLUP_INTERVAL, move || {
        let rollup = metrics::aggregate(&registry);
        info!(
            total = rollup.total_tasks,
            queued = rollup.queued,
            running = rollup.running,
            completed = rollup.completed,
            failed = rollup.failed,
            timeout = rollup.timeout,
            cancelled = rollup.cancelled,
            avg_duration_ms = rollup.avg_duration_ms,
            "Registry rollup"
        );
        Ok(())
    });

    let stop = shutdown.clone();
    http_server::run_server(state.clone(), async move { stop.cancelled().await })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    let killed = state.dispatcher.cancel_all();
    if killed > 0 {
        info!(killed, "Cancelled in-flight tasks");
    }
    scheduler.shutdown();
    sweeper.await.context("retention sweeper panicked")?;
    Ok(())
}

async fn run_once(cmd: Vec<String>, timeout: u64, limits: SandboxArgs) -> anyhow::Result<ExitCode> {
    let profile = limits.profile();
    check_profile(&profile, nix::unistd::geteuid().is_root())?;

    let cancel = install_shutdown_handler().context("installing signal handlers")?;
    let execution =
        tokio::task::spawn_blocking(move || sandbox::run_argv(&cmd, timeout, &profile, &cancel))
            .await
            .context("sandbox worker panicked")?
            .context("failed to start command")?;

    std::io::stdout().write_all(&execution.stdout)?;
    std::io::stderr().write_all(&execution.stderr)?;

    let code = match execution.outcome {
        ExitOutcome::Exited(code) => code,
        ExitOutcome::Signaled(signal) => 128 + signal,
        ExitOutcome::TimedOut => {
            eprintln!("Error: timed out after {timeout}s");
            124
        }
        ExitOutcome::Cancelled => 130,
    };
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
