//! # Scheduler
//!
//! One-shot and recurring timers backed by Tokio's monotonic clock. Every timer
//! hands back a [`Cancellable`]; once [`Cancellable::cancel`] returns, the timer
//! never starts another invocation.
//!
//! Recurring timers created with [`Scheduler::schedule_with_fixed_delay`] are
//! serialized: the next delay only starts after the previous invocation has
//! completed. Overlapping invocations require the explicit
//! [`Scheduler::schedule_at_fixed_rate_reentrant`].

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Scheduled,
    Cancelled,
    Completed,
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone)]
pub struct Cancellable {
    state: Arc<Mutex<TimerState>>,
    token: CancellationToken,
}

impl Cancellable {
    fn new(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::Scheduled)),
            token,
        }
    }

    /// Cancels the timer. Returns `false` when it had already completed or been
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TimerState::Scheduled {
            return false;
        }
        *state = TimerState::Cancelled;
        drop(state);
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.lock() == TimerState::Cancelled || self.token.is_cancelled()
    }

    /// Admits one invocation. Checked under the state lock, so nothing passes
    /// the gate after `cancel` has returned.
    fn admit(&self, last: bool) -> bool {
        let mut state = self.state.lock();
        if *state != TimerState::Scheduled || self.token.is_cancelled() {
            return false;
        }
        if last {
            *state = TimerState::Completed;
        }
        true
    }
}

/// Timer service shared by regions and routers.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, f: F) -> Cancellable
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = Cancellable::new(self.root.child_token());
        let timer = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if timer.admit(true) {
                        f();
                    }
                }
            }
        });
        handle
    }

    /// Runs `f` after `initial_delay` and then repeatedly, waiting `delay`
    /// between the end of one invocation and the start of the next.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut f: F,
    ) -> Cancellable
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = Cancellable::new(self.root.child_token());
        let timer = handle.clone();
        tokio::spawn(async move {
            let mut next = initial_delay;
            loop {
                tokio::select! {
                    _ = timer.token.cancelled() => break,
                    _ = tokio::time::sleep(next) => {}
                }
                if !timer.admit(false) {
                    break;
                }
                f().await;
                next = delay;
            }
            trace!("Fixed-delay timer stopped");
        });
        handle
    }

    /// Fires every `interval` regardless of whether earlier invocations have
    /// finished. Each invocation runs as its own task.
    pub fn schedule_at_fixed_rate_reentrant<F, Fut>(
        &self,
        initial_delay: Duration,
        interval: Duration,
        mut f: F,
    ) -> Cancellable
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = Cancellable::new(self.root.child_token());
        let timer = handle.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + initial_delay, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.token.cancelled() => break,
                    _ = ticks.tick() => {}
                }
                if !timer.admit(false) {
                    break;
                }
                tokio::spawn(f());
            }
            trace!("Fixed-rate timer stopped");
        });
        handle
    }

    /// Monotonic sleep, used for retry backoff.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Cancels every timer created by this scheduler.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
