/// Periodic Task Runner
///
/// Runs a background task on a fixed interval. Consecutive failures stretch
/// the wait with exponential backoff; a success restores the normal interval.
/// The loop ends when the shutdown flag flips to `true`.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Scheduling configuration for a background task
#[derive(Debug, Clone)]
pub struct PeriodicTaskConfig {
    /// Wait between successful runs
    pub interval: Duration,
    /// Upper bound on the wait after repeated failures
    pub max_backoff: Duration,
    /// Run once immediately instead of waiting a full interval first
    pub run_immediately: bool,
}

impl PeriodicTaskConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_backoff: interval.saturating_mul(8),
            run_immediately: false,
        }
    }
}

/// Internal backoff state
#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    fn new(interval: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_delay: interval,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) {
        self.consecutive_failures += 1;
        // Exponential backoff with cap
        self.current_delay = std::cmp::min(self.current_delay.saturating_mul(2), max_delay);
    }

    fn reset(&mut self, interval: Duration) {
        self.consecutive_failures = 0;
        self.current_delay = interval;
    }
}

/// Run `task_fn` every `config.interval` until `shutdown` becomes `true`
pub async fn run_periodic<F, Fut>(
    task_name: &str,
    config: PeriodicTaskConfig,
    mut shutdown: watch::Receiver<bool>,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = BackoffState::new(config.interval);
    let mut first = true;
    info!("Task '{}' scheduled every {:?}", task_name, config.interval);

    loop {
        if !(first && config.run_immediately) {
            let sender_gone = tokio::select! {
                _ = sleep(state.current_delay) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if sender_gone {
                break;
            }
        }
        first = false;
        if *shutdown.borrow() {
            break;
        }

        match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.interval);
            }
            Err(e) => {
                state.record_failure(config.max_backoff);
                error!(
                    "Task '{}' failed ({} consecutive): {}",
                    task_name, state.consecutive_failures, e
                );
                warn!("Task '{}' will retry in {:?}", task_name, state.current_delay);
            }
        }
    }

    info!("Task '{}' stopped", task_name);
}
