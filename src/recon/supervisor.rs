//! Supervisor
//!
//! Spawns one worker OS process per configured symbol and restarts crashed
//! workers with capped exponential backoff. The supervisor never touches
//! event data: it only reads heartbeat lines from worker stdout, aggregates
//! them into an operator status line, and propagates shutdown.
//!
//! Restart policy: a clean exit (code 0) is final. A failing worker is
//! restarted with `--resume`; two successive failures with an unchanged
//! latest checkpoint mark the symbol degraded and disable restarts.

use crate::recon::checkpoint::latest_checkpoint_seq;
use crate::recon::config::SupervisorConfig;
use crate::recon::error::ReconError;
use crate::recon::worker::Heartbeat;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Lifecycle of one supervised symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolState {
    Starting,
    Running,
    Restarting,
    /// Finished cleanly; not restarted.
    Done,
    /// Repeated failures at the same checkpoint; restarts disabled.
    Degraded,
}

/// Aggregated per-symbol status for the operator view.
#[derive(Debug, Clone)]
pub struct SymbolStatus {
    pub state: SymbolState,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub heartbeat: Option<Heartbeat>,
}

impl SymbolStatus {
    fn new() -> Self {
        SymbolStatus {
            state: SymbolState::Starting,
            restarts: 0,
            last_exit_code: None,
            heartbeat: None,
        }
    }
}

type StatusBoard = Arc<Mutex<HashMap<String, SymbolStatus>>>;

/// Run the supervisor until every worker has finished or been degraded.
/// Returns the process exit code.
pub async fn run_supervisor(config: SupervisorConfig) -> Result<i32, ReconError> {
    config.validate()?;

    let board: StatusBoard = Arc::new(Mutex::new(
        config
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolStatus::new()))
            .collect(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Propagate SIGINT/SIGTERM to workers.
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if wait_for_signal().await {
                info!("shutdown requested; stopping workers");
                let _ = shutdown_tx.send(true);
            }
        }
    });

    // Periodic operator status line.
    let status_task = tokio::spawn({
        let board = board.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => print_status(&board),
                    _ = shutdown_rx.changed() => break,
                }
            }
        }
    });

    let mut tasks = Vec::new();
    for symbol in &config.symbols {
        tasks.push(tokio::spawn(supervise_symbol(
            symbol.clone(),
            config.clone(),
            board.clone(),
            shutdown_rx.clone(),
        )));
    }

    let mut exit_code = 0;
    for task in tasks {
        match task.await {
            Ok(SymbolState::Done) => {}
            Ok(state) => {
                warn!(?state, "symbol did not finish cleanly");
                exit_code = 1;
            }
            Err(e) => {
                error!(error = %e, "supervision task panicked");
                exit_code = 1;
            }
        }
    }
    status_task.abort();
    print_status(&board);
    Ok(exit_code)
}

/// Supervise one symbol: spawn, monitor heartbeats, restart on failure.
async fn supervise_symbol(
    symbol: String,
    config: SupervisorConfig,
    board: StatusBoard,
    mut shutdown_rx: watch::Receiver<bool>,
) -> SymbolState {
    let checkpoint_root = PathBuf::from(&config.output_root).join("checkpoints");
    let mut backoff = INITIAL_BACKOFF;
    let mut restarts = 0u32;
    let mut failed_at_seq: Option<Option<u64>> = None;

    loop {
        // Restarts always resume; the first run follows configuration.
        let resume = config.resume || restarts > 0;
        let exit = match run_once(&symbol, &config, resume, &board, &mut shutdown_rx).await {
            Ok(code) => code,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to spawn worker");
                set_state(&board, &symbol, SymbolState::Degraded);
                return SymbolState::Degraded;
            }
        };

        {
            let mut board = board.lock();
            if let Some(status) = board.get_mut(&symbol) {
                status.last_exit_code = exit;
            }
        }

        if *shutdown_rx.borrow() {
            // Shutdown was propagated; a worker stopping now is final.
            let state = if exit == Some(0) {
                SymbolState::Done
            } else {
                SymbolState::Restarting
            };
            set_state(&board, &symbol, state);
            return state;
        }

        if exit == Some(0) {
            info!(symbol = %symbol, "worker finished");
            set_state(&board, &symbol, SymbolState::Done);
            return SymbolState::Done;
        }

        // Failure: compare the checkpoint frontier with the previous
        // failure before allowing another restart.
        let seq = latest_checkpoint_seq(&checkpoint_root, &symbol);
        if failed_at_seq == Some(seq) {
            error!(
                symbol = %symbol,
                exit_code = ?exit,
                checkpoint_seq = ?seq,
                "two successive failures at the same checkpoint; symbol degraded"
            );
            set_state(&board, &symbol, SymbolState::Degraded);
            return SymbolState::Degraded;
        }
        failed_at_seq = Some(seq);

        restarts += 1;
        if restarts > config.max_restarts {
            error!(symbol = %symbol, restarts, "restart budget exhausted");
            set_state(&board, &symbol, SymbolState::Degraded);
            return SymbolState::Degraded;
        }

        warn!(
            symbol = %symbol,
            exit_code = ?exit,
            restarts,
            backoff_s = backoff.as_secs(),
            "worker failed; restarting with --resume"
        );
        {
            let mut board = board.lock();
            if let Some(status) = board.get_mut(&symbol) {
                status.state = SymbolState::Restarting;
                status.restarts = restarts;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return SymbolState::Restarting,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Spawn one worker process and pump its heartbeats until it exits.
/// Returns the exit code (None when killed by signal).
async fn run_once(
    symbol: &str,
    config: &SupervisorConfig,
    resume: bool,
    board: &StatusBoard,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<Option<i32>, ReconError> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("run")
        .arg("--symbol")
        .arg(symbol)
        .arg("--input-root")
        .arg(&config.input_root)
        .arg("--output-root")
        .arg(&config.output_root);
    if resume {
        command.arg("--resume");
    }
    command.stdout(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();
    info!(symbol, pid = ?pid, resume, "worker spawned");
    set_state(board, symbol, SymbolState::Running);

    // Heartbeat pump: one JSON line per second from worker stdout.
    let stdout = child.stdout.take();
    let heartbeat_task = stdout.map(|stdout| {
        let board = board.clone();
        let symbol = symbol.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(heartbeat) = serde_json::from_str::<Heartbeat>(&line) {
                    let mut board = board.lock();
                    if let Some(status) = board.get_mut(&symbol) {
                        status.heartbeat = Some(heartbeat);
                    }
                }
            }
        })
    });

    let grace = Duration::from_millis(config.worker.shutdown_grace_ms);
    let mut stop_worker = false;
    let status = loop {
        if stop_worker {
            send_sigterm(pid);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => break status?,
                Err(_) => {
                    warn!(pid = ?pid, "worker ignored SIGTERM; killing");
                    child.kill().await?;
                    break child.wait().await?;
                }
            }
        }
        tokio::select! {
            status = child.wait() => break status?,
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    stop_worker = true;
                }
            }
        }
    };

    if let Some(task) = heartbeat_task {
        task.abort();
    }
    Ok(status.code())
}

/// Ask a worker to drain and exit.
fn send_sigterm(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Wait for SIGINT or SIGTERM. Returns true when a signal arrived.
async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return tokio::signal::ctrl_c().await.is_ok(),
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = term.recv() => true,
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}

fn set_state(board: &StatusBoard, symbol: &str, state: SymbolState) {
    let mut board = board.lock();
    if let Some(status) = board.get_mut(symbol) {
        status.state = state;
    }
}

/// One operator-visible line aggregating all workers.
fn print_status(board: &StatusBoard) {
    let board = board.lock();
    let mut parts: Vec<String> = Vec::with_capacity(board.len());
    let mut symbols: Vec<&String> = board.keys().collect();
    symbols.sort();
    for symbol in symbols {
        let status = &board[symbol];
        let events = status
            .heartbeat
            .as_ref()
            .map(|h| h.events_processed)
            .unwrap_or(0);
        let alerts = status
            .heartbeat
            .as_ref()
            .map(|h| h.drift_alert_count)
            .unwrap_or(0);
        parts.push(format!(
            "{}: {:?} events={} drift_alerts={} restarts={}",
            symbol, status.state, events, alerts, status.restarts
        ));
    }
    info!(status = %parts.join(" | "), "supervisor status");
}
