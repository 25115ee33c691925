/// Barter Sync TUI - Open Interest Dashboard
///
/// Reference consumer of the `barter-sync` runtime:
/// - open_interest: Binance open interest history (primary) & mark/funding (secondary) module
/// - chart: ratatui line-chart engine owned by the runtime's view renderer
/// - panels: dashboard layout & widgets
/// - config: env var helpers (SYMBOLS, UPSTREAM_URL, LOG_FILE)
pub mod chart;
pub mod config;
pub mod open_interest;
pub mod panels;

/// Surface the open interest chart is drawn into.
pub const CHART_SURFACE: &str = "oi-chart";

pub use chart::{ChartOptions, LineChart, SurfaceRegistry, TerminalChartEngine};
pub use open_interest::{FundingSnapshot, OiPoint, OiSummary, OpenInterestModule};
pub use panels::{OiView, render_ui};
