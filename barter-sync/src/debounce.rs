//! Input debouncing with a priority path for explicit user actions.

use derive_more::Display;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default quiet window before a burst of parameter changes executes.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Why a bound load task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Trigger {
    /// Debounced parameter change.
    #[display("input")]
    Input,
    /// Explicit user action (refresh button, direct selection).
    #[display("user_action")]
    UserAction,
    /// Background polling tick.
    #[display("poll")]
    Poll,
    /// Visibility regained or breaker cooldown expired.
    #[display("resume")]
    Resume,
}

impl Trigger {
    /// User-driven work preempts background work, never the reverse.
    pub fn is_user_driven(&self) -> bool {
        matches!(self, Trigger::Input | Trigger::UserAction)
    }
}

/// Task bound to an [`InputDebouncer`].
pub type BoundTask = Arc<dyn Fn(Trigger) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Default)]
struct BusyState {
    busy: bool,
    epoch: u64,
}

/// "Skip if busy" guard shared between a debouncer and the task it drives.
///
/// Background work takes the guard with [`BusyGuard::try_acquire`] and is skipped when it is
/// held. User work takes it unconditionally with [`BusyGuard::preempt`]. Releasing a token only
/// clears the guard if no newer holder has taken it since.
#[derive(Debug, Clone, Default)]
pub struct BusyGuard {
    state: Arc<Mutex<BusyState>>,
}

impl BusyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<BusyToken> {
        let mut state = self.state.lock();
        if state.busy {
            return None;
        }
        state.busy = true;
        state.epoch += 1;
        Some(BusyToken {
            guard: self.clone(),
            epoch: state.epoch,
        })
    }

    pub fn preempt(&self) -> BusyToken {
        let mut state = self.state.lock();
        state.busy = true;
        state.epoch += 1;
        BusyToken {
            guard: self.clone(),
            epoch: state.epoch,
        }
    }

    /// Force the guard free. Outstanding tokens become no-ops on release.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        state.epoch += 1;
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }
}

/// Held while guarded work runs; releases the [`BusyGuard`] on drop.
#[derive(Debug)]
pub struct BusyToken {
    guard: BusyGuard,
    epoch: u64,
}

impl Drop for BusyToken {
    fn drop(&mut self) {
        let mut state = self.guard.state.lock();
        if state.epoch == self.epoch {
            state.busy = false;
        }
    }
}

#[derive(Debug, Default)]
struct PendingRun {
    seq: u64,
    token: Option<CancellationToken>,
}

/// Coalesces bursts of [`trigger`](InputDebouncer::trigger) calls into one execution of the bound
/// task after a quiet window.
pub struct InputDebouncer {
    delay: Duration,
    guard: BusyGuard,
    task: BoundTask,
    pending: Arc<Mutex<PendingRun>>,
}

impl std::fmt::Debug for InputDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputDebouncer")
            .field("delay", &self.delay)
            .field("guard", &self.guard)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl InputDebouncer {
    pub fn new(delay: Duration, guard: BusyGuard, task: BoundTask) -> Self {
        Self {
            delay,
            guard,
            task,
            pending: Arc::new(Mutex::new(PendingRun::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn guard(&self) -> &BusyGuard {
        &self.guard
    }

    /// Schedule the bound task after the quiet window, restarting the window if a run is
    /// already pending.
    pub fn trigger(&self) {
        let token = CancellationToken::new();
        let seq = {
            let mut pending = self.pending.lock();
            pending.seq += 1;
            if let Some(prior) = pending.token.replace(token.clone()) {
                prior.cancel();
            }
            pending.seq
        };

        let delay = self.delay;
        let task = Arc::clone(&self.task);
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut pending = pending.lock();
                if pending.seq != seq {
                    return;
                }
                pending.token = None;
            }

            debug!(delay_ms = delay.as_millis() as u64, "debounce window elapsed, running task");
            task(Trigger::Input).await;
        });
    }

    /// Cancel any pending debounced run, clear the busy guard and run the task now.
    pub async fn instant(&self) {
        self.cancel();
        self.guard.clear();
        (self.task)(Trigger::UserAction).await;
    }

    /// Drop a pending debounced run without executing it.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock();
        pending.seq += 1;
        match pending.token.take() {
            Some(token) => {
                token.cancel();
                debug!("cancelled pending debounced run");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().token.is_some()
    }
}

impl Drop for InputDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::time::sleep;

    fn recording_task(runs: Arc<Mutex<Vec<Trigger>>>) -> BoundTask {
        Arc::new(move |trigger: Trigger| {
            let runs = Arc::clone(&runs);
            async move {
                runs.lock().push(trigger);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_execution() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = InputDebouncer::new(
            Duration::from_millis(50),
            BusyGuard::new(),
            recording_task(Arc::clone(&runs)),
        );

        for _ in 0..6 {
            debouncer.trigger();
            sleep(Duration::from_millis(20)).await;
        }
        assert!(debouncer.is_pending());
        assert!(runs.lock().is_empty());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(*runs.lock(), vec![Trigger::Input]);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_spaced_beyond_window_each_run() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = InputDebouncer::new(
            Duration::from_millis(50),
            BusyGuard::new(),
            recording_task(Arc::clone(&runs)),
        );

        debouncer.trigger();
        sleep(Duration::from_millis(80)).await;
        debouncer.trigger();
        sleep(Duration::from_millis(80)).await;

        assert_eq!(runs.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_runs_now_and_cancels_pending() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let debouncer = InputDebouncer::new(
            Duration::from_millis(50),
            BusyGuard::new(),
            recording_task(Arc::clone(&runs)),
        );

        debouncer.trigger();
        sleep(Duration::from_millis(10)).await;
        debouncer.instant().await;
        assert_eq!(*runs.lock(), vec![Trigger::UserAction]);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*runs.lock(), vec![Trigger::UserAction]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_clears_busy_guard_held_by_background_work() {
        let guard = BusyGuard::new();
        let ran = Arc::new(Mutex::new(0usize));

        let task: BoundTask = {
            let guard = guard.clone();
            let ran = Arc::clone(&ran);
            Arc::new(move |trigger: Trigger| {
                let guard = guard.clone();
                let ran = Arc::clone(&ran);
                async move {
                    let _busy = if trigger.is_user_driven() {
                        guard.preempt()
                    } else {
                        match guard.try_acquire() {
                            Some(token) => token,
                            None => return,
                        }
                    };
                    *ran.lock() += 1;
                }
                .boxed()
            })
        };
        let debouncer = InputDebouncer::new(Duration::from_millis(50), guard.clone(), task);

        // Background poll mid-flight
        let poll_token = guard.try_acquire().expect("guard free");
        assert!(guard.is_busy());

        debouncer.instant().await;
        assert_eq!(*ran.lock(), 1);

        // Releasing the superseded background token is a no-op
        drop(poll_token);
        assert!(!guard.is_busy());
    }

    #[test]
    fn test_busy_guard_release_does_not_clobber_newer_holder() {
        let guard = BusyGuard::new();

        let background = guard.try_acquire().expect("guard free");
        assert!(guard.try_acquire().is_none());

        let user = guard.preempt();
        drop(background);
        assert!(guard.is_busy());

        drop(user);
        assert!(!guard.is_busy());
        assert!(guard.try_acquire().is_some());
    }
}
