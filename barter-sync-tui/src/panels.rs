use crate::{
    chart::{SurfaceRegistry, TerminalChartEngine},
    open_interest::{FundingSnapshot, OiSummary, OpenInterestModule},
};
use barter_sync::{
    LoadPhase, ViewRenderer, ViewState, Unit, controller::WarningKind, scheduler::SchedulerStatus,
};
use chrono::Utc;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};

pub type OiView = ViewState<OpenInterestModule>;

/// Compact human formatting: 1234567 -> "1.23M".
pub fn format_compact(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1_000_000_000.0 {
        format!("{:.2}B", value / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("{:.2}M", value / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1}K", value / 1_000.0)
    } else {
        format!("{:.2}", value)
    }
}

fn format_value(value: f64, unit: Unit) -> String {
    match unit {
        Unit::Contracts => format_compact(value),
        Unit::Notional => format!("${}", format_compact(value)),
    }
}

/// Label & colour of the passive polling indicator.
pub fn status_label(status: SchedulerStatus) -> (String, Color) {
    match status {
        SchedulerStatus::Running => ("● LIVE".to_string(), Color::Green),
        SchedulerStatus::Paused => ("❚❚ PAUSED".to_string(), Color::Yellow),
        SchedulerStatus::Tripped { until } => {
            let remaining = until.saturating_duration_since(tokio::time::Instant::now());
            (format!("↻ RETRYING in {}s", remaining.as_secs()), Color::Red)
        }
        SchedulerStatus::Idle => ("○ IDLE".to_string(), Color::DarkGray),
        SchedulerStatus::Stopped => ("■ STOPPED".to_string(), Color::DarkGray),
    }
}

/// Draw the whole dashboard, syncing the chart surface with the laid-out area.
///
/// Returns whether the chart surface is attached after layout.
pub fn render_ui(
    f: &mut Frame<'_>,
    view: &OiView,
    renderer: &ViewRenderer<TerminalChartEngine>,
) -> bool {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(2),
        ])
        .split(f.area());

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(72), Constraint::Percentage(28)])
        .split(chunks[1]);

    let side = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(body[1]);

    render_header(f, view, chunks[0]);
    let attached = render_chart(f, view, renderer, body[0]);
    render_summary(f, view.summary.as_ref(), side[0]);
    render_funding(f, view.analytics.as_ref(), view, side[1]);
    render_footer(f, view, chunks[2]);
    attached
}

fn render_header(f: &mut Frame<'_>, view: &OiView, area: Rect) {
    let (status, status_color) = status_label(view.scheduler);
    let params = &view.params;

    let mut spans = vec![
        Span::styled(
            format!(" {} ", params.symbol),
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!("{} ", params.exchange), Style::default().fg(Color::Gray)),
        Span::raw("│ "),
        Span::styled(format!("interval {} ", params.interval), Style::default().fg(Color::Cyan)),
        Span::styled(format!("range {} ", params.range), Style::default().fg(Color::Cyan)),
        Span::styled(format!("unit {} ", params.unit), Style::default().fg(Color::Cyan)),
        Span::raw("│ "),
        Span::styled(status, Style::default().fg(status_color).add_modifier(Modifier::BOLD)),
    ];

    if view.load.is_loading || view.primary_phase != LoadPhase::Idle {
        spans.push(Span::styled("  ⟳ loading", Style::default().fg(Color::DarkGray)));
    }

    if let Some(last_success_at) = view.load.last_success_at {
        let age = Utc::now().signed_duration_since(last_success_at).num_seconds().max(0);
        spans.push(Span::styled(
            format!("  updated {age}s ago"),
            Style::default().fg(Color::DarkGray),
        ));
    }

    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .title(" OPEN INTEREST DASHBOARD ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );
    f.render_widget(header, area);
}

fn render_chart(
    f: &mut Frame<'_>,
    view: &OiView,
    renderer: &ViewRenderer<TerminalChartEngine>,
    area: Rect,
) -> bool {
    let surfaces: &SurfaceRegistry = renderer.engine().surfaces();
    let attached = surfaces.sync(renderer.surface(), area);

    let drawn = attached && renderer.with_instance(|chart| chart.draw(f, area)).is_some();
    if !drawn {
        let message = if !attached {
            "Terminal too small for chart"
        } else if view.load.error_count > 0 {
            "No data yet, retrying..."
        } else {
            "Waiting for open interest data..."
        };
        let placeholder = Paragraph::new(Line::from(Span::styled(
            message,
            Style::default().fg(Color::DarkGray),
        )))
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .title(" OPEN INTEREST ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White)),
        );
        f.render_widget(placeholder, area);
    }
    attached
}

fn render_summary(f: &mut Frame<'_>, summary: Option<&OiSummary>, area: Rect) {
    let block = Block::default()
        .title(" SUMMARY ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White));

    let lines = match summary {
        Some(summary) => {
            let change_color = if summary.change >= 0.0 {
                Color::Green
            } else {
                Color::Red
            };
            vec![
                Line::from(vec![
                    Span::styled("Latest: ", Style::default().fg(Color::Gray)),
                    Span::styled(
                        format_value(summary.latest, summary.unit),
                        Style::default().add_modifier(Modifier::BOLD),
                    ),
                ]),
                Line::from(vec![
                    Span::styled("Change: ", Style::default().fg(Color::Gray)),
                    Span::styled(
                        format!(
                            "{} ({:+.2}%)",
                            format_value(summary.change, summary.unit),
                            summary.change_pct
                        ),
                        Style::default().fg(change_color),
                    ),
                ]),
                Line::from(vec![
                    Span::styled("High:   ", Style::default().fg(Color::Gray)),
                    Span::raw(format_value(summary.high, summary.unit)),
                ]),
                Line::from(vec![
                    Span::styled("Low:    ", Style::default().fg(Color::Gray)),
                    Span::raw(format_value(summary.low, summary.unit)),
                ]),
                Line::from(vec![
                    Span::styled("As of:  ", Style::default().fg(Color::Gray)),
                    Span::raw(
                        summary
                            .as_of
                            .map(|time| time.format("%m-%d %H:%M UTC").to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ),
                ]),
            ]
        }
        None => vec![Line::from(Span::styled(
            "Waiting for data...",
            Style::default().fg(Color::DarkGray),
        ))],
    };

    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_funding(
    f: &mut Frame<'_>,
    funding: Option<&FundingSnapshot>,
    view: &OiView,
    area: Rect,
) {
    let block = Block::default()
        .title(" MARK & FUNDING ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White));

    let lines = match funding {
        Some(funding) => {
            let rate_color = if funding.funding_rate >= 0.0 {
                Color::Green
            } else {
                Color::Red
            };
            let to_funding = funding
                .next_funding_time
                .signed_duration_since(Utc::now())
                .num_minutes()
                .max(0);
            vec![
                Line::from(vec![
                    Span::styled("Mark:    ", Style::default().fg(Color::Gray)),
                    Span::raw(format!("{:.2}", funding.mark_price)),
                ]),
                Line::from(vec![
                    Span::styled("Premium: ", Style::default().fg(Color::Gray)),
                    Span::raw(format!("{:+.3}%", funding.premium_pct())),
                ]),
                Line::from(vec![
                    Span::styled("Funding: ", Style::default().fg(Color::Gray)),
                    Span::styled(
                        format!("{:+.4}%", funding.funding_rate * 100.0),
                        Style::default().fg(rate_color),
                    ),
                    Span::styled(
                        format!(" in {}h{:02}m", to_funding / 60, to_funding % 60),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]),
            ]
        }
        None if view.secondary_warning.is_some() => vec![Line::from(Span::styled(
            "Unavailable",
            Style::default().fg(Color::DarkGray),
        ))],
        None => vec![Line::from(Span::styled(
            "Waiting for data...",
            Style::default().fg(Color::DarkGray),
        ))],
    };

    f.render_widget(Paragraph::new(lines).block(block).wrap(Wrap { trim: true }), area);
}

fn render_footer(f: &mut Frame<'_>, view: &OiView, area: Rect) {
    let warning = view.warning.as_ref().map(|warning| {
        let label = match warning.kind {
            WarningKind::Timeout => "upstream slow",
            WarningKind::Failure => "update failed",
        };
        Line::from(vec![
            Span::styled(format!(" ⚠ {label}: "), Style::default().fg(Color::Yellow)),
            Span::styled(warning.message.clone(), Style::default().fg(Color::DarkGray)),
            Span::styled(
                format!(" ({} in a row, showing last good data)", view.load.error_count),
                Style::default().fg(Color::DarkGray),
            ),
        ])
    });

    let keys = Line::from(Span::styled(
        " [r] refresh  [s] symbol  [i] interval  [+/-] range  [u] unit  [p] pause  [q] quit",
        Style::default().fg(Color::DarkGray),
    ));

    let lines = match warning {
        Some(warning) => vec![warning, keys],
        None => vec![Line::raw(""), keys],
    };
    f.render_widget(Paragraph::new(lines), area);
}
