//! Visibility-aware fixed-cadence polling with a failure-count circuit breaker.
//!
//! Ticks never overlap: a tick that fires while the previous tick's work is outstanding is
//! skipped, not queued. After `failure_threshold` consecutive Timeout/Failure outcomes the
//! breaker trips, ticking halts and a single cooldown timer is armed. When it expires the breaker
//! resets, the task runs once and the cadence resumes from that point.

use crate::{debounce::Trigger, outcome::Outcome};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Task re-triggered by a [`PollingScheduler`]. Receives [`Trigger::Poll`] for cadence ticks and
/// [`Trigger::Resume`] for visibility regained, cooldown expiry and manual runs.
pub type PollTask = Arc<dyn Fn(Trigger) -> BoxFuture<'static, Outcome<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    /// Consecutive Timeout/Failure outcomes that trip the breaker. 0 disables the breaker.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Polling state owned by one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingSession {
    pub interval: Duration,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub paused: bool,
    pub last_run_at: Option<Instant>,
    pub tripped_until: Option<Instant>,
}

impl PollingSession {
    fn new(config: PollingConfig) -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            consecutive_failures: 0,
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            paused: false,
            last_run_at: None,
            tripped_until: None,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped_until.is_some()
    }
}

/// Passive status for a "live / paused / retrying" indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Idle,
    Running,
    Paused,
    Tripped { until: Instant },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    RunNow,
    Reset,
}

#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    commands: mpsc::UnboundedSender<Command>,
    _handle: JoinHandle<()>,
}

pub struct PollingScheduler {
    config: PollingConfig,
    session: Arc<Mutex<PollingSession>>,
    visibility: watch::Sender<bool>,
    status: Arc<watch::Sender<SchedulerStatus>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for PollingScheduler {
    fn default() -> Self {
        Self::new(PollingConfig::default())
    }
}

impl PollingScheduler {
    pub fn new(config: PollingConfig) -> Self {
        let (visibility, _) = watch::channel(true);
        let (status, _) = watch::channel(SchedulerStatus::Idle);
        Self {
            config,
            session: Arc::new(Mutex::new(PollingSession::new(config))),
            visibility,
            status: Arc::new(status),
            running: Mutex::new(None),
        }
    }

    /// Run `task` every `interval`, the first tick one interval from now. Restarts the loop if
    /// already running.
    pub fn start(&self, interval: Duration, task: PollTask) {
        self.shutdown_loop();

        let visible = *self.visibility.borrow();
        {
            let mut session = self.session.lock();
            session.interval = interval;
            session.consecutive_failures = 0;
            session.tripped_until = None;
            session.paused = !visible;
        }

        let shutdown = CancellationToken::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::channel(1);

        let poll_loop = PollLoop {
            task,
            interval,
            config: self.config,
            session: Arc::clone(&self.session),
            status: Arc::clone(&self.status),
            visible,
            in_flight: None,
            done_tx,
            shutdown: shutdown.clone(),
        };

        let handle = tokio::spawn(poll_loop.run(self.visibility.subscribe(), command_rx, done_rx));

        info!(interval_ms = interval.as_millis() as u64, "polling started");
        *self.running.lock() = Some(Running {
            shutdown,
            commands,
            _handle: handle,
        });
    }

    /// Stop ticking and cancel any pending cooldown. Idempotent.
    pub fn stop(&self) {
        if self.shutdown_loop() {
            info!("polling stopped");
        }
        self.status.send_replace(SchedulerStatus::Stopped);
    }

    fn shutdown_loop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                running.shutdown.cancel();
                true
            }
            None => false,
        }
    }

    /// Feed the visibility signal. hidden→visible runs the task immediately.
    pub fn set_visible(&self, visible: bool) {
        self.visibility.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.visibility.borrow()
    }

    /// Reset the breaker and run the task now, unless a tick is outstanding.
    pub fn trigger_now(&self) {
        self.send(Command::RunNow);
    }

    /// Reset the breaker and resume the cadence without running the task.
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    fn send(&self, command: Command) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.commands.send(command);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn session(&self) -> PollingSession {
        self.session.lock().clone()
    }

    pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SchedulerStatus {
        *self.status.borrow()
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.shutdown_loop();
    }
}

struct PollLoop {
    task: PollTask,
    interval: Duration,
    config: PollingConfig,
    session: Arc<Mutex<PollingSession>>,
    status: Arc<watch::Sender<SchedulerStatus>>,
    visible: bool,
    in_flight: Option<JoinHandle<()>>,
    done_tx: mpsc::Sender<Outcome<()>>,
    /// Cancelled by `stop`/`start`. Once cancelled the loop never publishes again.
    shutdown: CancellationToken,
}

impl PollLoop {
    async fn run(
        mut self,
        mut visibility: watch::Receiver<bool>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done_rx: mpsc::Receiver<Outcome<()>>,
    ) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = self.shutdown.clone();
        self.publish();

        loop {
            let tripped_until = self.session.lock().tripped_until;
            let cooldown = async move {
                match tripped_until {
                    Some(until) => sleep_until(until).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(outcome) = done_rx.recv() => {
                    self.in_flight = None;
                    self.record(outcome);
                }

                changed = visibility.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let visible = *visibility.borrow_and_update();
                    if visible == self.visible {
                        continue;
                    }
                    self.visible = visible;
                    self.session.lock().paused = !visible;

                    if visible {
                        debug!("view visible, resuming polling");
                        if tripped_until.is_none() {
                            self.dispatch(Trigger::Resume);
                            ticker.reset();
                        }
                    } else {
                        debug!("view hidden, pausing polling");
                    }
                    self.publish();
                }

                Some(command) = commands.recv() => {
                    self.reset_breaker();
                    if command == Command::RunNow {
                        self.dispatch(Trigger::Resume);
                    }
                    ticker.reset();
                    self.publish();
                }

                _ = cooldown, if tripped_until.is_some() => {
                    info!("circuit breaker cooldown elapsed, resuming polling");
                    self.reset_breaker();
                    if self.visible {
                        self.dispatch(Trigger::Resume);
                    }
                    ticker.reset();
                    self.publish();
                }

                _ = ticker.tick(), if self.visible && tripped_until.is_none() => {
                    self.dispatch(Trigger::Poll);
                }
            }
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort();
        }
        debug!("polling loop exited");
    }

    fn dispatch(&mut self, trigger: Trigger) {
        if self.in_flight.is_some() {
            debug!(%trigger, "previous tick still outstanding, skipping");
            return;
        }

        self.session.lock().last_run_at = Some(Instant::now());

        let work = (self.task)(trigger);
        let done_tx = self.done_tx.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let outcome = work.await;
            let _ = done_tx.send(outcome).await;
        }));
    }

    fn record(&mut self, outcome: Outcome<()>) {
        let mut session = self.session.lock();

        if outcome.is_success() {
            session.consecutive_failures = 0;
        } else if outcome.counts_as_failure() {
            session.consecutive_failures += 1;
            debug!(
                outcome = outcome.label(),
                consecutive_failures = session.consecutive_failures,
                "poll tick failed"
            );

            if self.config.failure_threshold > 0
                && session.consecutive_failures >= self.config.failure_threshold
            {
                let until = Instant::now() + self.config.cooldown;
                session.tripped_until = Some(until);
                warn!(
                    consecutive_failures = session.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit breaker tripped, polling halted"
                );
            }
        }

        drop(session);
        self.publish();
    }

    fn reset_breaker(&mut self) {
        let mut session = self.session.lock();
        session.consecutive_failures = 0;
        session.tripped_until = None;
    }

    fn publish(&self) {
        let status = match self.session.lock().tripped_until {
            Some(until) => SchedulerStatus::Tripped { until },
            None if !self.visible => SchedulerStatus::Paused,
            None => SchedulerStatus::Running,
        };
        // Checked under the watch lock, so a status published by a stopping loop can never land
        // after the Stopped sent by `stop`
        self.status.send_if_modified(|current| {
            if self.shutdown.is_cancelled() || *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting_task(
        runs: Arc<AtomicUsize>,
        outcome: impl Fn(usize) -> Outcome<()> + Send + Sync + 'static,
    ) -> PollTask {
        let outcome = Arc::new(outcome);
        Arc::new(move |_trigger: Trigger| {
            let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
            let outcome = Arc::clone(&outcome);
            async move { outcome(run) }.boxed()
        })
    }

    fn failure() -> Outcome<()> {
        Outcome::Failure(SyncError::Http("connection refused".to_string()))
    }

    fn config(threshold: u32, cooldown_secs: u64) -> PollingConfig {
        PollingConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_cadence() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(3, 60));
        scheduler.start(
            Duration::from_secs(1),
            counting_task(Arc::clone(&runs), |_| Outcome::Success(())),
        );

        sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let started = Arc::new(AtomicUsize::new(0));
        let task: PollTask = {
            let started = Arc::clone(&started);
            Arc::new(move |_trigger: Trigger| {
                started.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_millis(2_500)).await;
                    Outcome::Success(())
                }
                .boxed()
            })
        };

        let scheduler = PollingScheduler::new(config(3, 60));
        scheduler.start(Duration::from_secs(1), task);

        // Starts at 1s (busy until 3.5s), skips 2s & 3s, starts at 4s, skips 5s
        sleep(Duration::from_millis(5_200)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_then_resumes_after_cooldown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(3, 10));
        scheduler.start(
            Duration::from_secs(1),
            counting_task(Arc::clone(&runs), |run| {
                if run <= 3 { failure() } else { Outcome::Success(()) }
            }),
        );

        // Failures at 1s, 2s, 3s trip the breaker until 13s
        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(matches!(scheduler.current_status(), SchedulerStatus::Tripped { .. }));
        assert_eq!(scheduler.session().consecutive_failures, 3);

        sleep(Duration::from_millis(9_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // Cooldown expiry at 13s runs the task once and resumes
        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);
        let session = scheduler.session();
        assert_eq!(session.consecutive_failures, 0);
        assert!(!session.is_tripped());

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_outcomes_do_not_count() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(2, 10));
        scheduler.start(
            Duration::from_secs(1),
            counting_task(Arc::clone(&runs), |run| {
                if run % 2 == 0 { Outcome::Cancelled } else { Outcome::Timeout }
            }),
        );

        // timeout, cancelled, timeout: the breaker sees 2 consecutive failures only at run 3
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(scheduler.session().consecutive_failures, 1);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);

        sleep(Duration::from_millis(1_000)).await;
        assert!(matches!(scheduler.current_status(), SchedulerStatus::Tripped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_resets_breaker() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(3, 60));
        scheduler.start(
            Duration::from_secs(1),
            counting_task(Arc::clone(&runs), |_| failure()),
        );

        sleep(Duration::from_millis(3_500)).await;
        assert!(matches!(scheduler.current_status(), SchedulerStatus::Tripped { .. }));

        scheduler.trigger_now();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.session().consecutive_failures, 1);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_pauses_and_resumes_immediately() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(3, 60));
        scheduler.start(
            Duration::from_secs(10),
            counting_task(Arc::clone(&runs), |_| Outcome::Success(())),
        );

        sleep(Duration::from_secs(3)).await;
        scheduler.set_visible(false);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.current_status(), SchedulerStatus::Paused);

        // Hidden through the 10s tick
        sleep(Duration::from_secs(9)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Visible at ~12s runs immediately, next tick one interval later
        scheduler.set_visible(true);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);

        sleep(Duration::from_millis(9_900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_loop_never_overwrites_stopped_status() {
        let scheduler = PollingScheduler::new(config(3, 60));
        let (done_tx, _done_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let poll_loop = PollLoop {
            task: counting_task(Arc::new(AtomicUsize::new(0)), |_| Outcome::Success(())),
            interval: Duration::from_secs(1),
            config: config(3, 60),
            session: Arc::clone(&scheduler.session),
            status: Arc::clone(&scheduler.status),
            visible: true,
            in_flight: None,
            done_tx,
            shutdown: shutdown.clone(),
        };

        poll_loop.publish();
        assert_eq!(scheduler.current_status(), SchedulerStatus::Running);

        // Loop iteration racing with stop: cancelled, then Stopped sent, then a late publish
        shutdown.cancel();
        scheduler.status.send_replace(SchedulerStatus::Stopped);
        poll_loop.publish();
        assert_eq!(scheduler.current_status(), SchedulerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels_cooldown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(config(1, 5));
        scheduler.start(
            Duration::from_secs(1),
            counting_task(Arc::clone(&runs), |_| failure()),
        );

        sleep(Duration::from_millis(1_500)).await;
        assert!(matches!(scheduler.current_status(), SchedulerStatus::Tripped { .. }));

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.current_status(), SchedulerStatus::Stopped);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.current_status(), SchedulerStatus::Stopped);
    }
}
