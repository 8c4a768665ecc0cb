//! Background cleanup of the record store.
//!
//! A supervisor task owns the sweep loop and restarts it if it panics, so
//! the store cannot grow without bound because a single pass failed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{RecordStore, SweepReport};
use crate::config::EngineConfig;

/// The most recent completed sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastSweep {
    /// When the pass finished (store clock, epoch ms)
    pub at_ms: u64,
    /// What the pass did
    pub report: SweepReport,
}

/// One cleanup pass.
type SweepPass = Arc<dyn Fn() -> LastSweep + Send + Sync>;

/// Spawns the supervised sweep task.
pub struct Sweeper;

impl Sweeper {
    /// Start sweeping `store` on the configured interval.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(store: Arc<RecordStore>, config: &EngineConfig) -> SweeperHandle {
        Self::spawn_with(store, config.sweep_interval(), config.restart_delay())
    }

    /// Start sweeping with explicit timings.
    pub fn spawn_with(
        store: Arc<RecordStore>,
        interval: Duration,
        restart_delay: Duration,
    ) -> SweeperHandle {
        let pass: SweepPass = Arc::new(move || {
            let report = store.sweep();
            LastSweep {
                at_ms: store.now_ms(),
                report,
            }
        });
        Self::spawn_pass(pass, interval, restart_delay)
    }

    fn spawn_pass(pass: SweepPass, interval: Duration, restart_delay: Duration) -> SweeperHandle {
        let token = CancellationToken::new();
        let last_sweep = Arc::new(Mutex::new(None));
        let interval = interval.max(Duration::from_millis(1));

        info!(interval = ?interval, "Starting sweeper");

        let task = tokio::spawn(supervise(
            pass,
            interval,
            restart_delay,
            token.clone(),
            last_sweep.clone(),
        ));

        SweeperHandle {
            token,
            task: Some(task),
            last_sweep,
            interval,
        }
    }
}

/// Control handle for a running sweeper.
pub struct SweeperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    last_sweep: Arc<Mutex<Option<LastSweep>>>,
    interval: Duration,
}

impl SweeperHandle {
    /// The most recent completed sweep, if any.
    pub fn last_sweep(&self) -> Option<LastSweep> {
        *self.last_sweep.lock()
    }

    /// Whether the sweeper has fallen behind by more than `tolerance`
    /// intervals as of `now_ms`. A sweeper that has not completed a pass yet
    /// is measured from `started_ms`.
    pub fn is_stalled(&self, started_ms: u64, now_ms: u64, tolerance: u32) -> bool {
        let since = self.last_sweep().map_or(started_ms, |s| s.at_ms);
        let allowed = self
            .interval
            .saturating_mul(tolerance.max(1))
            .as_millis();
        u128::from(now_ms.saturating_sub(since)) > allowed
    }

    /// Whether the supervisor task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop sweeping and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
        info!("Sweeper stopped");
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        // Never outlive the handle.
        self.token.cancel();
    }
}

async fn supervise(
    pass: SweepPass,
    interval: Duration,
    restart_delay: Duration,
    token: CancellationToken,
    last_sweep: Arc<Mutex<Option<LastSweep>>>,
) {
    let mut restarts: u64 = 0;

    loop {
        let worker = tokio::spawn(sweep_loop(
            pass.clone(),
            interval,
            token.child_token(),
            last_sweep.clone(),
        ));

        match worker.await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                restarts += 1;
                error!(restarts = restarts, "Sweep loop panicked, restarting");
            }
            Err(e) => {
                warn!(error = %e, "Sweep loop cancelled");
                return;
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn sweep_loop(
    pass: SweepPass,
    interval: Duration,
    token: CancellationToken,
    last_sweep: Arc<Mutex<Option<LastSweep>>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let sweep = pass();
                debug!(
                    removed = sweep.report.removed,
                    decayed = sweep.report.decayed,
                    retained = sweep.report.retained,
                    "Sweep completed"
                );
                *last_sweep.lock() = Some(sweep);
            }
        }
    }
}
