#![warn(unused, clippy::unused_self, clippy::cast_lossless, rust_2018_idioms)]
#![allow(clippy::type_complexity)]

//! # Barter-Sync
//! Live data synchronisation & view-rendering runtime for polling market data dashboards.
//!
//! Each dashboard module fetches live data on a timer and on user interaction, keeps at most one
//! authoritative in-flight request per logical data class, tolerates slow or failing upstreams
//! without corrupting what is on display, and rebuilds its chart from scratch on every update.
//!
//! ## Components
//! * [`RequestCoordinator`](coordinator::RequestCoordinator): cancellation scopes, timeouts and
//!   ordering for async loads, partitioned by [`ClassTag`](coordinator::ClassTag).
//! * [`PollingScheduler`](scheduler::PollingScheduler): visibility-aware fixed cadence with a
//!   failure-count circuit breaker.
//! * [`InputDebouncer`](debounce::InputDebouncer): coalesces bursts of parameter changes, with an
//!   instant path for explicit user actions.
//! * [`ViewRenderer`](render::ViewRenderer): exclusive ownership of one
//!   [`ChartEngine`](render::ChartEngine) instance per surface with destroy-before-rebuild.
//! * [`ResponseCache`](cache::ResponseCache): TTL-keyed payload cache shared across a session.
//! * [`Controller`](controller::Controller): wires the above together for one
//!   [`DashboardModule`](controller::DashboardModule).

/// Settlement of a coordinated load: Success, Cancelled, Timeout or Failure.
pub mod outcome;

/// All [`Error`](std::error::Error)s generated in Barter-Sync.
pub mod error;

/// User-adjustable dashboard parameters.
pub mod params;

/// Upstream data [`Provider`](provider::Provider) seam and its HTTP implementation.
pub mod provider;

/// [`SyncConfig`](config::SyncConfig) and `SYNC_*` environment overrides.
pub mod config;

/// `tracing` subscriber initialisation.
pub mod logging;

pub mod cache;
pub mod coordinator;
pub mod debounce;
pub mod scheduler;
pub mod render;
pub mod controller;

pub use config::SyncConfig;
pub use controller::{Controller, DashboardModule, LoadPhase, LoadState, ViewState, Warning};
pub use coordinator::{ClassTag, RequestCoordinator};
pub use error::{RenderError, SyncError};
pub use outcome::Outcome;
pub use params::{Interval, Params, Range, Unit};
pub use provider::{DataRequest, HttpProvider, Provider, ResponseShape};
pub use render::{ChartEngine, RenderOutcome, SurfaceId, Teardown, ViewRenderer};
