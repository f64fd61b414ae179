//! Reconnection scheduler
//!
//! Owns the single pending reconnect timer and the attempt counters.
//! A timer is a spawned task that sleeps for the backoff delay and then
//! invokes its fire callback with the timer generation; the owner checks
//! that generation with [`ReconnectScheduler::take_fired`] so a timer that
//! woke up just as it was cancelled cannot act on newer state.

use std::time::Duration;

use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;

#[derive(Debug)]
struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Result of [`ReconnectScheduler::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Timer armed for attempt number `attempt` (1-based)
    Armed { attempt: u32, delay: Duration },
    /// Ceiling reached, nothing armed
    GiveUp { attempts: u32 },
}

#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempt: u32,
    total_attempts: u32,
    timer: Option<PendingTimer>,
    next_generation: u64,
}

impl ReconnectScheduler {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempt: 0,
            total_attempts: 0,
            timer: None,
            next_generation: 1,
        }
    }

    /// Arm the next reconnect timer, or give up once the ceiling is reached.
    ///
    /// Any pending timer is cancelled first. `fire` runs on the timer task
    /// after the delay and receives the timer generation.
    pub fn schedule<F>(&mut self, fire: F) -> ScheduleOutcome
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();

        if self.attempt >= self.max_attempts {
            warn!(
                attempts = self.attempt,
                max_attempts = self.max_attempts,
                "reconnect_give_up"
            );
            return ScheduleOutcome::GiveUp {
                attempts: self.max_attempts,
            };
        }

        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        self.total_attempts += 1;

        let generation = self.next_generation;
        self.next_generation += 1;

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            fire(generation);
        });
        self.timer = Some(PendingTimer { generation, handle });

        info!(
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect_scheduled"
        );

        ScheduleOutcome::Armed {
            attempt: self.attempt,
            delay,
        }
    }

    /// Claim a fired timer. Returns `false` if `generation` is not the
    /// pending timer (cancelled or superseded).
    pub fn take_fired(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                self.timer = None;
                true
            }
            _ => {
                debug!(generation, "stale reconnect timer ignored");
                false
            }
        }
    }

    /// Abort the pending timer. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            debug!(generation = timer.generation, "reconnect timer cancelled");
        }
    }

    /// Cancel and zero the attempt counter. The lifetime total is kept.
    pub fn reset(&mut self) {
        self.cancel();
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn has_pending(&self) -> bool {
        self.timer.is_some()
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
