//! Exclusive ownership of one visualization instance per display surface.
//!
//! A [`ViewRenderer`] never patches its instance. Every [`render`](ViewRenderer::render) destroys
//! the current instance, waits for the engine to finish tearing it down, then constructs a fresh
//! one bound to the same surface. Structural changes between updates (series count, axis count,
//! overlay toggles) therefore never leave stale engine state behind.
//!
//! Only one render runs per view. A render requested while another is in progress is dropped,
//! not queued: the most recently completed render is authoritative and callers render again on
//! their next state update.

use crate::error::RenderError;
use derive_more::{Display, From};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Delay used when an engine cannot signal teardown completion.
pub const DEFAULT_TEARDOWN_FALLBACK: Duration = Duration::from_millis(50);

/// Upper bound on waiting for an engine's teardown signal.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Stable address of a drawing target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Deserialize, Serialize)]
pub struct SurfaceId(SmolStr);

impl SurfaceId {
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SurfaceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How an engine reports that a destroyed instance has released its surface-bound resources.
#[derive(Debug)]
pub enum Teardown {
    /// Resources were released synchronously.
    Complete,
    /// Resources are released once the signal fires (or its sender is dropped).
    Pending(oneshot::Receiver<()>),
    /// The engine offers no completion signal; wait the fallback delay.
    Unsignalled,
}

/// Seam to a stateful rendering engine.
pub trait ChartEngine: Send + Sync + 'static {
    type Instance: Send + 'static;
    type Dataset: Send + 'static;
    type Options: Send + 'static;

    /// Build a new instance bound to `surface`. Must fail with
    /// [`RenderError::SurfaceMissing`] or [`RenderError::SurfaceDetached`] if the surface cannot
    /// be drawn to.
    fn construct(
        &self,
        surface: &SurfaceId,
        dataset: Self::Dataset,
        options: Self::Options,
    ) -> Result<Self::Instance, RenderError>;

    /// Halt any running animation or transition before the instance is released.
    fn stop_animation(&self, _instance: &mut Self::Instance) {}

    fn destroy(&self, instance: Self::Instance) -> Result<Teardown, RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderConfig {
    pub teardown_fallback: Duration,
    pub teardown_timeout: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            teardown_fallback: DEFAULT_TEARDOWN_FALLBACK,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// One destroy + construct cycle completed.
    Rendered,
    /// Another render was in progress.
    Dropped,
    /// The surface was absent or detached; no instance exists until the next render.
    SurfaceUnavailable,
    /// The engine failed to construct; no instance exists until the next render.
    Failed(RenderError),
    /// The view was permanently destroyed.
    Unmounted,
}

#[derive(Debug)]
struct ChartView<I> {
    current: Option<I>,
    render_in_progress: bool,
    unmounted: bool,
    renders_completed: u64,
}

/// Clears `render_in_progress` when the render future completes or is dropped.
struct RenderInProgress<'a, I> {
    view: &'a Mutex<ChartView<I>>,
}

impl<I> Drop for RenderInProgress<'_, I> {
    fn drop(&mut self) {
        self.view.lock().render_in_progress = false;
    }
}

/// Owns the [`ChartEngine`] instance of one display surface.
pub struct ViewRenderer<E: ChartEngine> {
    engine: Arc<E>,
    surface: SurfaceId,
    config: RenderConfig,
    view: Mutex<ChartView<E::Instance>>,
}

impl<E: ChartEngine> std::fmt::Debug for ViewRenderer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.lock();
        f.debug_struct("ViewRenderer")
            .field("surface", &self.surface)
            .field("config", &self.config)
            .field("has_instance", &view.current.is_some())
            .field("render_in_progress", &view.render_in_progress)
            .field("unmounted", &view.unmounted)
            .field("renders_completed", &view.renders_completed)
            .finish()
    }
}

impl<E: ChartEngine> ViewRenderer<E> {
    pub fn new(engine: Arc<E>, surface: SurfaceId, config: RenderConfig) -> Self {
        Self {
            engine,
            surface,
            config,
            view: Mutex::new(ChartView {
                current: None,
                render_in_progress: false,
                unmounted: false,
                renders_completed: 0,
            }),
        }
    }

    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Destroy the current instance and construct a new one from `dataset` & `options`.
    pub async fn render(&self, dataset: E::Dataset, options: E::Options) -> RenderOutcome {
        let previous = {
            let mut view = self.view.lock();
            if view.unmounted {
                return RenderOutcome::Unmounted;
            }
            if view.render_in_progress {
                debug!(surface = %self.surface, "render already in progress, dropping");
                return RenderOutcome::Dropped;
            }
            view.render_in_progress = true;
            view.current.take()
        };
        let _in_progress = RenderInProgress { view: &self.view };

        if let Some(instance) = previous {
            self.destroy_and_wait(instance).await;
        }

        match self.engine.construct(&self.surface, dataset, options) {
            Ok(instance) => {
                let mut view = self.view.lock();
                if view.unmounted {
                    drop(view);
                    debug!(surface = %self.surface, "view unmounted during render, releasing instance");
                    self.destroy_detached(instance);
                    return RenderOutcome::Unmounted;
                }
                view.current = Some(instance);
                view.renders_completed += 1;
                debug!(surface = %self.surface, renders = view.renders_completed, "render complete");
                RenderOutcome::Rendered
            }
            Err(error @ (RenderError::SurfaceMissing(_) | RenderError::SurfaceDetached(_))) => {
                warn!(surface = %self.surface, %error, "surface unavailable, skipping construct");
                RenderOutcome::SurfaceUnavailable
            }
            Err(error) => {
                error!(surface = %self.surface, %error, "chart construct failed");
                RenderOutcome::Failed(error)
            }
        }
    }

    async fn destroy_and_wait(&self, mut instance: E::Instance) {
        self.engine.stop_animation(&mut instance);

        match self.engine.destroy(instance) {
            Ok(Teardown::Complete) => {}
            Ok(Teardown::Pending(signal)) => {
                match tokio::time::timeout(self.config.teardown_timeout, signal).await {
                    Ok(_) => {}
                    Err(_) => warn!(
                        surface = %self.surface,
                        timeout_ms = self.config.teardown_timeout.as_millis() as u64,
                        "teardown signal not received, rebuilding anyway"
                    ),
                }
            }
            Ok(Teardown::Unsignalled) => {
                tokio::time::sleep(self.config.teardown_fallback).await;
            }
            Err(error) => {
                // Detached surfaces cannot be torn down cleanly; the instance is gone either way
                warn!(surface = %self.surface, %error, "destroy failed, continuing");
            }
        }
    }

    fn destroy_detached(&self, mut instance: E::Instance) {
        self.engine.stop_animation(&mut instance);
        if let Err(error) = self.engine.destroy(instance) {
            warn!(surface = %self.surface, %error, "destroy failed during unmount");
        }
    }

    /// Permanently destroy the view. Later renders return [`RenderOutcome::Unmounted`].
    pub fn unmount(&self) {
        let instance = {
            let mut view = self.view.lock();
            if view.unmounted {
                return;
            }
            view.unmounted = true;
            view.current.take()
        };

        if let Some(instance) = instance {
            self.destroy_detached(instance);
        }
        debug!(surface = %self.surface, "view unmounted");
    }

    /// Read access to the current instance, eg/ for a draw loop.
    pub fn with_instance<R, F>(&self, op: F) -> Option<R>
    where
        F: FnOnce(&E::Instance) -> R,
    {
        self.view.lock().current.as_ref().map(op)
    }

    pub fn has_instance(&self) -> bool {
        self.view.lock().current.is_some()
    }

    pub fn is_rendering(&self) -> bool {
        self.view.lock().render_in_progress
    }

    pub fn is_unmounted(&self) -> bool {
        self.view.lock().unmounted
    }

    pub fn renders_completed(&self) -> u64 {
        self.view.lock().renders_completed
    }
}

impl<E: ChartEngine> Drop for ViewRenderer<E> {
    fn drop(&mut self) {
        self.unmount();
    }
}
