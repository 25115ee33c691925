//! Wires debouncing, coordination, polling, caching and rendering into one dashboard module.
//!
//! ```text
//! params change ──► InputDebouncer ──┐
//! refresh ─────────► instant() ──────┼──► load ──► issue(primary) ──► commit ──► ViewRenderer
//! timer / resume ──► PollingScheduler┘      └───► issue(secondary) ─► commit (analytics only)
//! ```

use crate::{
    cache::ResponseCache,
    config::SyncConfig,
    coordinator::{ClassTag, RequestCoordinator},
    debounce::{BoundTask, BusyGuard, InputDebouncer, Trigger},
    error::SyncError,
    outcome::Outcome,
    params::Params,
    provider::{DataRequest, Provider},
    render::{ChartEngine, RenderOutcome, SurfaceId, ViewRenderer},
    scheduler::{PollTask, PollingScheduler, PollingSession, SchedulerStatus},
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-module contract: how to request, parse, summarise and chart one dashboard's data.
///
/// Domain math lives in implementations. The runtime only moves the results around.
pub trait DashboardModule: Send + Sync + 'static {
    type Series: Clone + Send + Sync + 'static;
    type Summary: Clone + Send + Sync + 'static;
    type Analytics: Clone + Send + Sync + 'static;
    type Engine: ChartEngine;

    fn primary(&self, params: &Params) -> DataRequest;

    fn parse_primary(&self, params: &Params, payload: &Value) -> Result<Self::Series, SyncError>;

    fn summarize(&self, params: &Params, series: &Self::Series) -> Self::Summary;

    fn chart(
        &self,
        params: &Params,
        series: &Self::Series,
        summary: &Self::Summary,
    ) -> (
        <Self::Engine as ChartEngine>::Dataset,
        <Self::Engine as ChartEngine>::Options,
    );

    /// Auxiliary analytics request, loaded independently of the primary path.
    fn secondary(&self, _params: &Params) -> Option<DataRequest> {
        None
    }

    fn parse_secondary(
        &self,
        _params: &Params,
        _payload: &Value,
    ) -> Result<Self::Analytics, SyncError> {
        Err(SyncError::Parse("module has no secondary data".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadState {
    pub is_loading: bool,
    /// Consecutive primary Timeout/Failure outcomes, reset on success.
    pub error_count: u32,
    pub last_params: Option<Params>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Display)]
pub enum LoadPhase {
    #[default]
    #[display("idle")]
    Idle,
    #[display("requesting")]
    Requesting,
    #[display("applying")]
    Applying,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum WarningKind {
    #[display("timeout")]
    Timeout,
    #[display("failure")]
    Failure,
}

/// Soft, non-blocking notice that a load failed while older data stays on display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub class: ClassTag,
    pub kind: WarningKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Warning {
    fn from_outcome<T>(class: &ClassTag, outcome: &Outcome<T>) -> Option<Self> {
        let (kind, message) = match outcome {
            Outcome::Timeout => (WarningKind::Timeout, "request timed out".to_string()),
            Outcome::Failure(error) => (WarningKind::Failure, error.to_string()),
            Outcome::Success(_) | Outcome::Cancelled => return None,
        };
        Some(Self {
            class: class.clone(),
            kind,
            message,
            at: Utc::now(),
        })
    }
}

/// Read-only snapshot a consumer draws from.
#[derive(Debug, Clone)]
pub struct ViewState<M: DashboardModule> {
    pub params: Params,
    pub load: LoadState,
    pub primary_phase: LoadPhase,
    pub secondary_phase: LoadPhase,
    pub series: Option<M::Series>,
    pub summary: Option<M::Summary>,
    pub analytics: Option<M::Analytics>,
    pub warning: Option<Warning>,
    pub secondary_warning: Option<Warning>,
    pub scheduler: SchedulerStatus,
    pub renders_completed: u64,
}

#[derive(Debug, Default)]
struct ClassLoad {
    in_flight: u32,
    applying: bool,
}

impl ClassLoad {
    fn phase(&self) -> LoadPhase {
        if self.applying {
            LoadPhase::Applying
        } else if self.in_flight > 0 {
            LoadPhase::Requesting
        } else {
            LoadPhase::Idle
        }
    }
}

struct ControllerState<M: DashboardModule> {
    params: Params,
    load: LoadState,
    primary: ClassLoad,
    secondary: ClassLoad,
    series: Option<M::Series>,
    summary: Option<M::Summary>,
    analytics: Option<M::Analytics>,
    warning: Option<Warning>,
    secondary_warning: Option<Warning>,
    /// Bumped on every committed primary result.
    version: u64,
}

struct Inner<M: DashboardModule> {
    module: M,
    provider: Arc<dyn Provider>,
    coordinator: RequestCoordinator,
    cache: ResponseCache<Value>,
    renderer: ViewRenderer<M::Engine>,
    guard: BusyGuard,
    state: Mutex<ControllerState<M>>,
    /// Cancelled on unmount. Loads racing it are dropped and never commit.
    shutdown: CancellationToken,
}

impl<M: DashboardModule> Inner<M> {
    fn is_unmounted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn load(self: Arc<Self>, trigger: Trigger) -> Outcome<()> {
        if self.is_unmounted() {
            debug!(%trigger, "controller unmounted, ignoring load");
            return Outcome::Cancelled;
        }

        let shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Outcome::Cancelled,
            outcome = self.run_load(trigger) => outcome,
        }
    }

    async fn run_load(self: Arc<Self>, trigger: Trigger) -> Outcome<()> {
        // User work always preempts background work, never the reverse
        let _busy = if trigger.is_user_driven() {
            self.guard.preempt()
        } else {
            match self.guard.try_acquire() {
                Some(token) => token,
                None => {
                    debug!(%trigger, "user load in flight, skipping background load");
                    return Outcome::Cancelled;
                }
            }
        };

        let params = self.state.lock().params.clone();

        if let Some(request) = self.module.secondary(&params) {
            let secondary = Arc::clone(&self).load_secondary(params.clone(), request, trigger);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = secondary => {}
                }
            });
        }

        self.load_primary(params, trigger).await
    }

    async fn load_primary(&self, params: Params, trigger: Trigger) -> Outcome<()> {
        let class = ClassTag::primary();
        let request = self.module.primary(&params);
        {
            let mut state = self.state.lock();
            state.primary.in_flight += 1;
            state.load.is_loading = true;
            state.load.last_params = Some(params.clone());
        }
        debug!(%trigger, symbol = %params.symbol, interval = %params.interval, "primary load");

        let operation = async {
            let (payload, fetched) = self.fetch(&class, &request, trigger).await?;
            let series = self.module.parse_primary(&params, &payload)?;
            if fetched {
                self.cache.set_for_class(&class, request.cache_key(), payload);
            }
            Ok::<_, SyncError>(series)
        };
        let (ticket, outcome) = self.coordinator.issue_scoped(&class, operation).await;

        let result = match outcome {
            Outcome::Success(series) => {
                let summary = self.module.summarize(&params, &series);
                let committed = self.coordinator.commit(&ticket, || {
                    if self.is_unmounted() {
                        return false;
                    }
                    let mut state = self.state.lock();
                    state.series = Some(series);
                    state.summary = Some(summary);
                    state.load.error_count = 0;
                    state.load.last_success_at = Some(Utc::now());
                    state.warning = None;
                    state.primary.applying = true;
                    state.version += 1;
                    true
                });

                match committed {
                    Some(true) => {
                        self.render_latest().await;
                        Outcome::Success(())
                    }
                    Some(false) | None => Outcome::Cancelled,
                }
            }
            Outcome::Cancelled => {
                debug!(generation = ticket.generation(), "primary load superseded");
                Outcome::Cancelled
            }
            failed => {
                let warning = Warning::from_outcome(&class, &failed);
                let mut state = self.state.lock();
                state.load.error_count += 1;
                state.warning = warning;
                warn!(
                    outcome = failed.label(),
                    error_count = state.load.error_count,
                    symbol = %params.symbol,
                    "primary load failed, retaining displayed data"
                );
                failed.map(|_| ())
            }
        };

        let mut state = self.state.lock();
        state.primary.in_flight = state.primary.in_flight.saturating_sub(1);
        state.primary.applying = false;
        state.load.is_loading = state.primary.in_flight > 0;
        result
    }

    async fn load_secondary(self: Arc<Self>, params: Params, request: DataRequest, trigger: Trigger) {
        let class = ClassTag::secondary();
        self.state.lock().secondary.in_flight += 1;

        let operation = async {
            let (payload, fetched) = self.fetch(&class, &request, trigger).await?;
            let analytics = self.module.parse_secondary(&params, &payload)?;
            if fetched {
                self.cache.set_for_class(&class, request.cache_key(), payload);
            }
            Ok::<_, SyncError>(analytics)
        };
        let (ticket, outcome) = self.coordinator.issue_scoped(&class, operation).await;

        match outcome {
            Outcome::Success(analytics) => {
                self.coordinator.commit(&ticket, || {
                    if self.is_unmounted() {
                        return;
                    }
                    let mut state = self.state.lock();
                    state.analytics = Some(analytics);
                    state.secondary_warning = None;
                });
            }
            Outcome::Cancelled => {}
            failed => {
                match &failed {
                    Outcome::Failure(error) if error.is_transient() => {
                        debug!(%error, "secondary load failed, will retry on next tick")
                    }
                    _ => warn!(outcome = failed.label(), "secondary load failed"),
                }
                self.state.lock().secondary_warning = Warning::from_outcome(&class, &failed);
            }
        }

        let mut state = self.state.lock();
        state.secondary.in_flight = state.secondary.in_flight.saturating_sub(1);
    }

    /// Cached payload if fresh, otherwise the provider's. User-driven loads always refetch.
    ///
    /// Returns whether the payload came from the provider and should be cached once parsed.
    async fn fetch(
        &self,
        class: &ClassTag,
        request: &DataRequest,
        trigger: Trigger,
    ) -> Result<(Value, bool), SyncError> {
        if !trigger.is_user_driven() {
            if let Some(payload) = self.cache.get(&request.cache_key()) {
                debug!(class = %class, endpoint = %request.endpoint, "cache hit");
                return Ok((payload, false));
            }
        }
        let payload = self.provider.fetch_request(request).await?;
        Ok((payload, true))
    }

    /// Render the latest committed data, re-rendering while newer data lands mid-render.
    async fn render_latest(&self) {
        loop {
            let (version, dataset, options) = {
                let state = self.state.lock();
                let (Some(series), Some(summary)) = (&state.series, &state.summary) else {
                    return;
                };
                let (dataset, options) = self.module.chart(&state.params, series, summary);
                (state.version, dataset, options)
            };

            match self.renderer.render(dataset, options).await {
                RenderOutcome::Rendered => {}
                RenderOutcome::Dropped => {
                    // In-progress render picks up this version when it completes
                    return;
                }
                RenderOutcome::SurfaceUnavailable | RenderOutcome::Unmounted => return,
                RenderOutcome::Failed(error) => {
                    warn!(%error, "render failed");
                    return;
                }
            }

            if self.state.lock().version == version {
                return;
            }
            debug!(version, "newer data committed during render, re-rendering");
        }
    }
}

/// One dashboard module driven by the runtime.
pub struct Controller<M: DashboardModule> {
    inner: Arc<Inner<M>>,
    config: SyncConfig,
    debouncer: InputDebouncer,
    scheduler: PollingScheduler,
}

impl<M: DashboardModule> std::fmt::Debug for Controller<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("renderer", &self.inner.renderer)
            .field("debouncer", &self.debouncer)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Controller`].
pub struct ControllerBuilder<M: DashboardModule> {
    module: M,
    provider: Arc<dyn Provider>,
    engine: Arc<M::Engine>,
    surface: SurfaceId,
    params: Params,
    config: SyncConfig,
    coordinator: Option<RequestCoordinator>,
    cache: Option<ResponseCache<Value>>,
}

impl<M: DashboardModule> ControllerBuilder<M> {
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Session-shared cache. Defaults to a private cache using the config's TTL policy.
    pub fn cache(mut self, cache: ResponseCache<Value>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn coordinator(mut self, coordinator: RequestCoordinator) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn build(self) -> Controller<M> {
        let Self {
            module,
            provider,
            engine,
            surface,
            params,
            config,
            coordinator,
            cache,
        } = self;

        let guard = BusyGuard::new();
        let inner = Arc::new(Inner {
            module,
            provider,
            coordinator: coordinator
                .unwrap_or_else(|| RequestCoordinator::new(config.coordinator_config())),
            cache: cache.unwrap_or_else(|| ResponseCache::new(config.ttl_policy())),
            renderer: ViewRenderer::new(engine, surface, config.render_config()),
            guard: guard.clone(),
            state: Mutex::new(ControllerState {
                params,
                load: LoadState::default(),
                primary: ClassLoad::default(),
                secondary: ClassLoad::default(),
                series: None,
                summary: None,
                analytics: None,
                warning: None,
                secondary_warning: None,
                version: 0,
            }),
            shutdown: CancellationToken::new(),
        });

        let task: BoundTask = {
            let inner = Arc::clone(&inner);
            Arc::new(move |trigger: Trigger| {
                Arc::clone(&inner).load(trigger).map(|_| ()).boxed()
            })
        };

        Controller {
            debouncer: InputDebouncer::new(config.debounce, guard, task),
            scheduler: PollingScheduler::new(config.polling_config()),
            inner,
            config,
        }
    }
}

impl<M: DashboardModule> Controller<M> {
    pub fn builder(
        module: M,
        provider: Arc<dyn Provider>,
        engine: Arc<M::Engine>,
        surface: SurfaceId,
    ) -> ControllerBuilder<M> {
        ControllerBuilder {
            module,
            provider,
            engine,
            surface,
            params: Params::default(),
            config: SyncConfig::default(),
            coordinator: None,
            cache: None,
        }
    }

    /// Start polling and perform the initial load.
    pub fn mount(&self) {
        if self.inner.is_unmounted() {
            warn!(surface = %self.inner.renderer.surface(), "controller already unmounted, not mounting");
            return;
        }

        let task: PollTask = {
            let inner = Arc::clone(&self.inner);
            Arc::new(move |trigger: Trigger| Arc::clone(&inner).load(trigger).boxed())
        };
        self.scheduler.start(self.config.poll_interval, task);

        info!(
            surface = %self.inner.renderer.surface(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "dashboard mounted"
        );
        tokio::spawn(Arc::clone(&self.inner).load(Trigger::UserAction));
    }

    /// Apply a parameter change through the debounce window. Returns false if nothing changed.
    pub fn set_params<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut Params),
    {
        if self.update_params(update) {
            self.debouncer.trigger();
            true
        } else {
            false
        }
    }

    /// Apply a direct parameter selection immediately, preempting background work.
    pub async fn select_params<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut Params),
    {
        if self.update_params(update) {
            self.debouncer.instant().await;
            true
        } else {
            false
        }
    }

    fn update_params<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut Params),
    {
        let mut state = self.inner.state.lock();
        let mut params = state.params.clone();
        update(&mut params);
        if params == state.params {
            return false;
        }
        debug!(symbol = %params.symbol, interval = %params.interval, range = %params.range, "params changed");
        state.params = params;
        true
    }

    /// Explicit user refresh: resets the failure breaker and reloads now, bypassing the cache.
    pub async fn refresh(&self) {
        self.scheduler.reset();
        self.debouncer.instant().await;
    }

    /// Rebuild the view from the latest committed data without loading, eg/ after its surface
    /// was re-attached.
    pub async fn rerender(&self) {
        self.inner.render_latest().await;
    }

    pub fn set_visible(&self, visible: bool) {
        self.scheduler.set_visible(visible);
    }

    pub fn params(&self) -> Params {
        self.inner.state.lock().params.clone()
    }

    pub fn snapshot(&self) -> ViewState<M> {
        let scheduler = self.scheduler.current_status();
        let renders_completed = self.inner.renderer.renders_completed();
        let state = self.inner.state.lock();
        ViewState {
            params: state.params.clone(),
            load: state.load.clone(),
            primary_phase: state.primary.phase(),
            secondary_phase: state.secondary.phase(),
            series: state.series.clone(),
            summary: state.summary.clone(),
            analytics: state.analytics.clone(),
            warning: state.warning.clone(),
            secondary_warning: state.secondary_warning.clone(),
            scheduler,
            renders_completed,
        }
    }

    pub fn renderer(&self) -> &ViewRenderer<M::Engine> {
        &self.inner.renderer
    }

    pub fn module(&self) -> &M {
        &self.inner.module
    }

    pub fn scheduler_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.scheduler.status()
    }

    /// Polling cadence & circuit breaker counters.
    pub fn polling_session(&self) -> PollingSession {
        self.scheduler.session()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancel pending input, stop polling, cancel outstanding loads and destroy the view.
    ///
    /// Permanent: loads requested afterwards resolve [`Outcome::Cancelled`] without reaching the
    /// provider.
    pub fn unmount(&self) {
        self.inner.shutdown.cancel();
        self.debouncer.cancel();
        self.scheduler.stop();
        let cancelled = self.inner.coordinator.cancel_all();
        self.inner.renderer.unmount();
        {
            let mut state = self.inner.state.lock();
            state.primary = ClassLoad::default();
            state.secondary = ClassLoad::default();
            state.load.is_loading = false;
        }
        info!(
            surface = %self.inner.renderer.surface(),
            cancelled,
            "dashboard unmounted"
        );
    }
}
