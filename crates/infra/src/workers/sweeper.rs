use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::ledger::{ReservationLedger, SweepReport};
use crate::store::{CartLineStore, StockStore};

/// Handle to control a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the task to stop.
    ///
    /// A pass already in progress runs to completion first; the returned
    /// stats include it.
    pub async fn shutdown(mut self) -> SweeperStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "expiry sweeper task panicked");
            }
        }
        self.stats()
    }

    /// Current sweeper statistics.
    pub fn stats(&self) -> SweeperStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Sweeper runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweeperStats {
    /// Completed passes, failed ones included.
    pub passes: u64,
    /// Passes that could not list expired lines.
    pub failed_passes: u64,
    pub lines_released: u64,
    pub units_released: u64,
    /// Lines that could not be reclaimed, summed over passes.
    pub line_failures: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl SweeperStats {
    fn record(&mut self, report: &SweepReport, at: DateTime<Utc>) {
        self.passes += 1;
        self.lines_released += report.released_lines as u64;
        self.units_released += report.released_units;
        self.line_failures += report.failures.len() as u64;
        self.last_run = Some(at);
    }

    fn record_failure(&mut self, at: DateTime<Utc>) {
        self.passes += 1;
        self.failed_passes += 1;
        self.last_run = Some(at);
    }
}

/// Periodic reclamation of expired reservations.
///
/// One tokio task runs [`ReservationLedger::sweep_expired`] per tick. The
/// first tick fires immediately, so holds that expired while the process was
/// down are reclaimed at startup.
#[derive(Debug)]
pub struct ExpirySweeper;

impl ExpirySweeper {
    pub fn spawn<S, L>(ledger: ReservationLedger<S, L>, interval: Duration) -> SweeperHandle
    where
        S: StockStore + 'static,
        L: CartLineStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let stats = Arc::new(Mutex::new(SweeperStats::default()));

        let join = tokio::spawn(sweeper_loop(ledger, interval, shutdown_rx, stats.clone()));

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}

async fn sweeper_loop<S, L>(
    ledger: ReservationLedger<S, L>,
    interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
    stats: Arc<Mutex<SweeperStats>>,
) where
    S: StockStore,
    L: CartLineStore,
{
    info!(interval_secs = interval.as_secs(), "expiry sweeper started");

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                let result = ledger.sweep_expired().await;
                let at = ledger.now();
                let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
                match result {
                    Ok(report) => {
                        debug!(scanned = report.scanned, released_units = report.released_units, "sweep pass finished");
                        s.record(&report, at);
                    }
                    Err(e) => {
                        error!(error = %e, "sweep pass failed");
                        s.record_failure(at);
                    }
                }
            }
        }
    }

    info!("expiry sweeper stopped");
}
