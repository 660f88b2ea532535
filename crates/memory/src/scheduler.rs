//! Scheduled consolidation.
//!
//! Spawns the background task that runs the sleep cycle once per interval,
//! inside a quiet window, and wires the process shutdown channel into the
//! cycle's abort signal so an in-flight cycle winds down promptly instead of
//! blocking exit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use keepsake_config::{SchedulerConfig, SleepConfig};
use keepsake_llm::AbortHandle;

use crate::engine::MemoryEngine;

const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Whether `hour` falls inside the quiet window, handling midnight
/// wrap-around (e.g. 22..6).
fn in_quiet_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Spawn the periodic consolidation task. Gated by:
///   1. the quiet window (`quiet_start_hour..quiet_end_hour`);
///   2. at least `interval_hours` since the last run.
///
/// Sending `true` on `shutdown_tx` stops the task and aborts any cycle in
/// flight; partial progress is kept.
pub fn spawn_consolidation_task(
    engine: Arc<MemoryEngine>,
    shutdown_tx: &watch::Sender<bool>,
    scheduler: SchedulerConfig,
    sleep_config: SleepConfig,
) -> JoinHandle<()> {
    let mut rx = shutdown_tx.subscribe();
    let mut abort_rx = shutdown_tx.subscribe();
    let (abort_handle, abort_signal) = AbortHandle::new();

    // Relay shutdown into the cycle's abort signal.
    tokio::spawn(async move {
        loop {
            if *abort_rx.borrow() {
                abort_handle.abort();
                return;
            }
            if abort_rx.changed().await.is_err() {
                return;
            }
        }
    });

    tokio::spawn(async move {
        let min_gap = Duration::from_secs(scheduler.interval_hours * 60 * 60);
        let mut last_run: Option<std::time::Instant> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() { break; }
                    continue;
                }
            }

            let hour = Utc::now().hour();
            if !in_quiet_window(hour, scheduler.quiet_start_hour, scheduler.quiet_end_hour) {
                continue;
            }
            if last_run.is_some_and(|t| t.elapsed() < min_gap) {
                continue;
            }

            last_run = Some(std::time::Instant::now());
            let result = engine
                .run_sleep_cycle(sleep_config.clone(), abort_signal.clone(), None)
                .await;
            if result.aborted {
                warn!("scheduled sleep cycle aborted mid-run");
                break;
            }
            info!(
                merges = result.vector_merges,
                pruned = result.memories_pruned,
                duration_ms = result.duration_ms,
                "scheduled sleep cycle complete"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_window_handles_wraparound() {
        // Plain window 2..6.
        assert!(in_quiet_window(2, 2, 6));
        assert!(in_quiet_window(5, 2, 6));
        assert!(!in_quiet_window(6, 2, 6));
        assert!(!in_quiet_window(23, 2, 6));
        // Wrapped window 22..6 spans midnight.
        assert!(in_quiet_window(23, 22, 6));
        assert!(in_quiet_window(1, 22, 6));
        assert!(!in_quiet_window(12, 22, 6));
    }
}
