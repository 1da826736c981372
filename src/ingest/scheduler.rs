// src/ingest/scheduler.rs
// Periodic cycle driver: one interval task per process, jittered start,
// missed ticks coalesced, busy ticks skipped via the orchestrator's
// single-flight lock.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::ingest::cycle::Orchestrator;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// Upper bound of the random delay added before each tick's cycle.
    pub jitter: Duration,
}

/// Spawn the periodic ingestion driver. The returned handle is aborted at
/// shutdown; an in-flight cycle is not joined (best-effort stop).
pub fn spawn_scheduler(orchestrator: Arc<Orchestrator>, cfg: SchedulerCfg) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        // A cycle longer than the interval must not queue catch-up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            target: "ingest",
            interval_secs = cfg.interval.as_secs(),
            jitter_secs = cfg.jitter.as_secs(),
            "scheduler started"
        );

        loop {
            ticker.tick().await;

            // Jitter keeps multiple instances from aligning on the clock.
            if !cfg.jitter.is_zero() {
                let jitter_ms = rand::rng().random_range(0..=cfg.jitter.as_millis() as u64);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }

            match orchestrator.try_run().await {
                None => {
                    // Busy: logged inside try_run, nothing to queue.
                }
                Some(Ok(summary)) => {
                    gauge!("ingest_last_cycle_ts").set(chrono::Utc::now().timestamp() as f64);
                    info!(
                        target: "ingest",
                        total_feeds = summary.total_feeds,
                        failed_feeds = summary.failed_feeds,
                        inserted = summary.total_items_inserted,
                        "scheduled cycle finished"
                    );
                }
                Some(Err(error)) => {
                    counter!("ingest_cycle_errors_total").increment(1);
                    warn!(target: "ingest", error = %error, "scheduled cycle failed");
                }
            }
        }
    })
}
