//! Periodic triggering of stage cycles.
//!
//! Each stage owns an [`InFlight`] flag. A tick that finds the previous cycle of
//! the same stage still running is skipped, so at most one cycle per stage runs
//! at any time. Cycles of different stages are independent.

use crate::worker::StageWorker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Per-stage "cycle running" flag.
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicBool>);

impl InFlight {
    /// Claims the flag, or returns `None` if a cycle already holds it.
    pub fn try_begin(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(&self.0)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the flag when dropped, including while unwinding.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StageScheduler {
    worker: StageWorker,
    interval: Duration,
    in_flight: InFlight,
}

impl StageScheduler {
    pub fn new(worker: StageWorker) -> Self {
        let interval = worker.settings().interval;
        Self {
            worker,
            interval,
            in_flight: InFlight::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Starts a cycle unless the previous one is still running.
    pub fn tick(&self, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        let Some(guard) = self.in_flight.try_begin() else {
            debug!("{} is still running, skipping tick", self.worker.name());
            return None;
        };

        let worker = self.worker.clone();
        let cancel = cancel.clone();
        let span = info_span!("stage", stage = %worker.name());
        Some(tokio::spawn(
            async move {
                let _guard = guard;
                match worker.run_cycle(&cancel).await {
                    Ok(report) => trace!(?report, "Cycle finished"),
                    Err(err) => error!(
                        message = "Cycle failed, retrying on next tick",
                        error = %err
                    ),
                }
            }
            .instrument(span),
        ))
    }

    /// Ticks every `interval` until `cancel` fires, then waits for the running
    /// cycle to wind down.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            batch_limit = self.worker.settings().batch_limit,
            "Starting {} scheduler",
            self.worker.name()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(handle) = self.tick(&cancel) {
                        current = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = current {
            if let Err(err) = handle.await {
                error!(message = "Cycle task ended abnormally", error = ?err);
            }
        }
        info!("{} scheduler stopped", self.worker.name());
    }
}
