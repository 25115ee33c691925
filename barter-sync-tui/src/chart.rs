//! Terminal line-chart engine for the [`ViewRenderer`](barter_sync::ViewRenderer).

use crate::panels::format_compact;
use barter_sync::{ChartEngine, RenderError, SurfaceId, Teardown};
use chrono::DateTime;
use parking_lot::Mutex;
use ratatui::{
    Frame,
    layout::Rect,
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType},
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Duration of the left-to-right reveal of a freshly built chart.
pub const REVEAL_DURATION: Duration = Duration::from_millis(400);

/// Smallest area a chart can be drawn into.
pub const MIN_CHART_WIDTH: u16 = 20;
pub const MIN_CHART_HEIGHT: u16 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct ChartOptions {
    pub title: String,
    pub x_bounds: [f64; 2],
    pub y_bounds: [f64; 2],
    pub animate: bool,
}

/// Terminal areas currently available for drawing, keyed by [`SurfaceId`].
///
/// The draw loop re-syncs each surface every frame, so a surface squeezed below the minimum size
/// (or not laid out at all) is detached until the terminal grows again.
#[derive(Debug, Clone, Default)]
pub struct SurfaceRegistry {
    surfaces: Arc<Mutex<HashMap<SurfaceId, Rect>>>,
}

impl SurfaceRegistry {
    pub fn attach(&self, surface: SurfaceId, area: Rect) {
        self.surfaces.lock().insert(surface, area);
    }

    pub fn detach(&self, surface: &SurfaceId) -> bool {
        self.surfaces.lock().remove(surface).is_some()
    }

    /// Attach `surface` at `area` if it is large enough to draw into, otherwise detach it.
    pub fn sync(&self, surface: &SurfaceId, area: Rect) -> bool {
        if area.width >= MIN_CHART_WIDTH && area.height >= MIN_CHART_HEIGHT {
            self.attach(surface.clone(), area);
            true
        } else {
            self.detach(surface);
            false
        }
    }

    pub fn is_attached(&self, surface: &SurfaceId) -> bool {
        self.surfaces.lock().contains_key(surface)
    }

    pub fn area(&self, surface: &SurfaceId) -> Option<Rect> {
        self.surfaces.lock().get(surface).copied()
    }
}

/// One built chart. Immutable once constructed apart from its animation flag.
#[derive(Debug)]
pub struct LineChart {
    surface: SurfaceId,
    build: u64,
    points: Vec<(f64, f64)>,
    options: ChartOptions,
    built_at: Instant,
    animating: bool,
}

impl LineChart {
    pub fn build(&self) -> u64 {
        self.build
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    pub fn options(&self) -> &ChartOptions {
        &self.options
    }

    pub fn is_animating(&self, now: Instant) -> bool {
        self.animating && now.saturating_duration_since(self.built_at) < REVEAL_DURATION
    }

    /// Points revealed so far by the build animation.
    pub fn visible_points(&self, now: Instant) -> &[(f64, f64)] {
        if !self.is_animating(now) {
            return &self.points;
        }
        let progress = now.saturating_duration_since(self.built_at).as_secs_f64()
            / REVEAL_DURATION.as_secs_f64();
        let shown = ((self.points.len() as f64 * progress).ceil() as usize).min(self.points.len());
        &self.points[..shown]
    }

    pub fn draw(&self, f: &mut Frame<'_>, area: Rect) {
        let visible = self.visible_points(Instant::now());
        let [x_min, x_max] = self.options.x_bounds;
        let [y_min, y_max] = self.options.y_bounds;

        let dataset = Dataset::default()
            .marker(Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Cyan))
            .data(visible);

        let x_axis = Axis::default()
            .style(Style::default().fg(Color::Gray))
            .bounds([x_min, x_max])
            .labels([time_label(x_min), time_label((x_min + x_max) / 2.0), time_label(x_max)]);

        let y_axis = Axis::default()
            .style(Style::default().fg(Color::Gray))
            .bounds([y_min, y_max])
            .labels([
                Span::raw(format_compact(y_min)),
                Span::raw(format_compact((y_min + y_max) / 2.0)),
                Span::raw(format_compact(y_max)),
            ]);

        let chart = Chart::new(vec![dataset])
            .block(
                Block::default()
                    .title(Span::styled(
                        self.options.title.clone(),
                        Style::default().add_modifier(Modifier::BOLD),
                    ))
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(Color::White)),
            )
            .x_axis(x_axis)
            .y_axis(y_axis);

        f.render_widget(chart, area);
    }
}

fn time_label(timestamp: f64) -> Span<'static> {
    let label = DateTime::from_timestamp(timestamp as i64, 0)
        .map(|time| time.format("%m-%d %H:%M").to_string())
        .unwrap_or_default();
    Span::raw(label)
}

/// [`ChartEngine`] producing [`LineChart`]s bound to areas of a [`SurfaceRegistry`].
#[derive(Debug, Default)]
pub struct TerminalChartEngine {
    surfaces: SurfaceRegistry,
    builds: AtomicU64,
    live: AtomicUsize,
}

impl TerminalChartEngine {
    pub fn new(surfaces: SurfaceRegistry) -> Self {
        Self {
            surfaces,
            builds: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    /// Charts constructed and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl ChartEngine for TerminalChartEngine {
    type Instance = LineChart;
    type Dataset = Vec<(f64, f64)>;
    type Options = ChartOptions;

    fn construct(
        &self,
        surface: &SurfaceId,
        points: Self::Dataset,
        options: Self::Options,
    ) -> Result<Self::Instance, RenderError> {
        if !self.surfaces.is_attached(surface) {
            return Err(RenderError::SurfaceMissing(surface.clone()));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(LineChart {
            surface: surface.clone(),
            build: self.builds.fetch_add(1, Ordering::SeqCst) + 1,
            points,
            animating: options.animate,
            options,
            built_at: Instant::now(),
        })
    }

    fn stop_animation(&self, instance: &mut Self::Instance) {
        instance.animating = false;
    }

    fn destroy(&self, instance: Self::Instance) -> Result<Teardown, RenderError> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if self.surfaces.is_attached(&instance.surface) {
            Ok(Teardown::Complete)
        } else {
            Err(RenderError::SurfaceDetached(instance.surface))
        }
    }
}
