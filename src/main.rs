//! Reconstruction runner CLI
//!
//! # Usage
//!
//! ```bash
//! # Run one symbol worker
//! reconstruct run --symbol btcusdt --input-root /data/raw --output-root /data/unified
//!
//! # Resume a symbol after a crash
//! reconstruct run --symbol btcusdt --input-root /data/raw --output-root /data/unified --resume
//!
//! # Run the supervisor over a symbol roster
//! reconstruct supervise --config fleet.toml
//!
//! # Re-hash committed output files
//! reconstruct verify --manifest /data/unified/btcusdt/manifest.json
//! ```
//!
//! # Exit Codes
//!
//! - 0: success
//! - 1: generic error / verification failure
//! - 2: configuration error
//! - 3: schema mismatch
//! - 4: sink failure
//! - 5: checkpoint corruption
//! - 6: arithmetic overflow / precision loss
//! - 7: bootstrap overflow
//! - 8: input out-of-order

use clap::{Parser, Subcommand};
use reconstruct::recon::config::{ReconConfig, SupervisorConfig};
use reconstruct::recon::manifest::verify_manifest;
use reconstruct::recon::supervisor::run_supervisor;
use reconstruct::recon::worker::{run_worker, Heartbeat, ShutdownFlag, WorkerOptions, WorkerStats};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reconstruct", about = "Deterministic market event reconstruction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one symbol worker.
    Run {
        /// Trading symbol (one worker per symbol).
        #[arg(long)]
        symbol: String,
        /// Root of the recorded input store.
        #[arg(long, env = "RECONSTRUCT_INPUT_ROOT")]
        input_root: PathBuf,
        /// Root of the unified output store.
        #[arg(long, env = "RECONSTRUCT_OUTPUT_ROOT")]
        output_root: PathBuf,
        /// Checkpoint root (default: <output-root>/checkpoints).
        #[arg(long)]
        checkpoint_root: Option<PathBuf>,
        /// Resume from the latest verifiable checkpoint.
        #[arg(long)]
        resume: bool,
        /// Worker configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the supervisor for a configured set of symbols.
    Supervise {
        /// Supervisor configuration file (TOML).
        #[arg(long)]
        config: PathBuf,
    },
    /// Re-hash and re-scan every file a sink manifest lists.
    Verify {
        /// Path to a symbol's manifest.json.
        #[arg(long)]
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            symbol,
            input_root,
            output_root,
            checkpoint_root,
            resume,
            config,
        } => run_command(symbol, input_root, output_root, checkpoint_root, resume, config).await,
        Commands::Supervise { config } => supervise_command(config).await,
        Commands::Verify { manifest } => verify_command(manifest),
    };
    std::process::exit(code);
}

async fn run_command(
    symbol: String,
    input_root: PathBuf,
    output_root: PathBuf,
    checkpoint_root: Option<PathBuf>,
    resume: bool,
    config_path: Option<PathBuf>,
) -> i32 {
    let config = match config_path {
        Some(path) => match ReconConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "invalid configuration");
                return e.exit_code();
            }
        },
        None => ReconConfig::default(),
    };

    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let options = WorkerOptions {
        checkpoint_root: checkpoint_root.unwrap_or_else(|| output_root.join("checkpoints")),
        symbol: symbol.clone(),
        input_root,
        output_root,
        resume,
        config,
    };

    let shutdown = Arc::new(ShutdownFlag::default());
    let stats = Arc::new(WorkerStats::default());

    // Heartbeat on stdout, one JSON line per second; logs go to stderr.
    let heartbeat_task = tokio::spawn({
        let stats = stats.clone();
        let symbol = symbol.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let heartbeat = Heartbeat::sample(&symbol, &stats);
                if let Ok(line) = serde_json::to_string(&heartbeat) {
                    let mut stdout = std::io::stdout();
                    let _ = writeln!(stdout, "{}", line);
                    let _ = stdout.flush();
                }
            }
        }
    });

    let mut pipeline = tokio::task::spawn_blocking({
        let shutdown = shutdown.clone();
        let stats = stats.clone();
        move || run_worker(options, shutdown, stats)
    });

    let mut signals = 0u32;
    let code = loop {
        tokio::select! {
            result = &mut pipeline => {
                break match result {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        error!(error = %e, "worker failed");
                        e.exit_code()
                    }
                    Err(e) => {
                        error!(error = %e, "worker panicked");
                        1
                    }
                };
            }
            _ = stop_signal() => {
                signals += 1;
                if signals == 1 {
                    info!("graceful stop requested; draining");
                    shutdown.request_graceful();
                } else {
                    info!(grace_ms = grace.as_millis() as u64, "emergency stop requested");
                    shutdown.request_emergency();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        std::process::exit(1);
                    });
                }
            }
        }
    };

    heartbeat_task.abort();
    code
}

async fn supervise_command(config_path: PathBuf) -> i32 {
    let config = match SupervisorConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return e.exit_code();
        }
    };
    match run_supervisor(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "supervisor failed");
            e.exit_code()
        }
    }
}

fn verify_command(manifest: PathBuf) -> i32 {
    match verify_manifest(&manifest) {
        Ok(report) => {
            if report.ok() {
                info!(files = report.files_checked, "manifest verified");
                0
            } else {
                for failure in &report.failures {
                    error!(file = %failure.file, detail = %failure.detail, "verification failure");
                }
                error!(
                    files = report.files_checked,
                    failures = report.failures.len(),
                    "manifest verification failed"
                );
                1
            }
        }
        Err(e) => {
            error!(error = %e, "verification error");
            e.exit_code()
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
