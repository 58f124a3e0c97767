//! Policy layer for scheduling a reconnect attempt after a backoff delay.
//!
//! This never touches upstream state itself — it owns only per-upstream
//! attempt counters and pending timers, and invokes an operator-supplied
//! callback when a timer fires. Unlike a blocking retry loop, a scheduled
//! timer can be cancelled mid-flight (shutdown, a manual reconnect, a config
//! change that removes the upstream).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// `min(initialDelay * 2^n, maxDelay)`.
pub fn calculate_backoff(attempt: u32, initial_delay: Duration, max_delay: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    initial_delay.saturating_mul(multiplier).min(max_delay)
}

struct PendingTimer {
    handle: JoinHandle<()>,
}

pub struct ReconnectScheduler {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: Mutex<HashMap<String, u32>>,
    pending: Mutex<HashMap<String, PendingTimer>>,
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl ReconnectScheduler {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            attempts: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn attempt_count(&self, name: &str) -> u32 {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    /// Installs a one-shot timer for `name`. On firing, `reconnect` is
    /// invoked; on success the attempt counter resets, on failure the next
    /// attempt is scheduled with the counter incremented, and reaching
    /// `max_attempts` logs an error and gives up. A new call for the same
    /// name replaces any timer already pending for it.
    pub fn schedule_reconnect<F, Fut>(self: &Arc<Self>, name: impl Into<String>, reconnect: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), crate::error::SpikeError>> + Send + 'static,
    {
        let name = name.into();
        let attempt = self.attempt_count(&name);

        if attempt >= self.max_attempts {
            error!(upstream = %name, attempt, "reconnect attempts exhausted, giving up");
            return;
        }

        let delay = calculate_backoff(attempt, self.initial_delay, self.max_delay);
        let scheduler = Arc::clone(self);
        let fire_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.pending.lock().remove(&fire_name);

            match reconnect().await {
                Ok(()) => {
                    scheduler.attempts.lock().remove(&fire_name);
                }
                Err(err) => {
                    warn!(upstream = %fire_name, %err, attempt, "reconnect attempt failed");
                    scheduler
                        .attempts
                        .lock()
                        .insert(fire_name.clone(), attempt + 1);
                    if attempt + 1 < scheduler.max_attempts {
                        scheduler.schedule_reconnect(fire_name, reconnect);
                    } else {
                        error!(upstream = %fire_name, "reconnect attempts exhausted, giving up");
                    }
                }
            }
        });

        self.pending.lock().insert(name, PendingTimer { handle });
    }

    /// Cancels a single pending timer, if any.
    pub fn cancel(&self, name: &str) {
        if let Some(timer) = self.pending.lock().remove(name) {
            timer.handle.abort();
        }
    }

    /// Whether a timer is currently pending for `name`.
    pub fn has_pending(&self, name: &str) -> bool {
        self.pending.lock().contains_key(name)
    }

    /// Cancels every pending timer.
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock();
        for (_, timer) in pending.drain() {
            timer.handle.abort();
        }
    }
}
