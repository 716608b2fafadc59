//! Scheduler — fires a poll cycle on a fixed interval until shut down.
//!
//! Cycles run one at a time on the scheduler task. Ticks missed while a cycle
//! is running collapse into a single immediate tick rather than queueing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::{CycleReport, Responder};

/// A unit of work run once per tick.
#[async_trait]
pub trait PollCycle: Send + Sync {
    async fn run_cycle(&self) -> Result<CycleReport, PipelineError>;
}

#[async_trait]
impl PollCycle for Responder {
    async fn run_cycle(&self) -> Result<CycleReport, PipelineError> {
        Responder::run_cycle(self).await
    }
}

/// Spawn the polling loop. The first cycle starts immediately.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling
/// after the cycle in progress.
pub fn spawn_scheduler(
    cycle: Arc<dyn PollCycle>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Scheduler started — polling every {}s", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            run_once(cycle.as_ref()).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run one cycle and log its outcome. Errors never escape: the next tick retries.
async fn run_once(cycle: &dyn PollCycle) {
    let cycle_id = Uuid::new_v4();
    let span = info_span!("poll_cycle", %cycle_id);
    let started = Instant::now();

    match cycle.run_cycle().instrument(span.clone()).await {
        Ok(report) => span.in_scope(|| {
            info!(
                matched = report.matched,
                replied = report.replied,
                fallbacks = report.fallbacks,
                skipped = report.skipped,
                send_failures = report.send_failures,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Poll cycle complete"
            )
        }),
        Err(e) => span.in_scope(|| {
            error!(error = %e, "Poll cycle failed, retrying next tick");
        }),
    }
}
