/// Open Interest Dashboard
///
/// Polls Binance open interest history & mark/funding through the barter-sync runtime and
/// rebuilds the chart on every update. Logs go to LOG_FILE so the alternate screen stays clean.
use std::{
    error::Error,
    fs::OpenOptions,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use barter_sync::{
    Controller, HttpProvider, Params, SurfaceId, SyncConfig, logging::init_logging_to,
};
use barter_sync_tui::{
    CHART_SURFACE, OpenInterestModule, SurfaceRegistry, TerminalChartEngine,
    config::{get_log_file, get_symbols, get_upstream_url, next_symbol, upstream_shape},
    render_ui,
};
use crossterm::{
    event::{
        self, DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture,
        Event, KeyCode, KeyEventKind,
    },
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use rustls::crypto::ring::default_provider;
use tracing::info;

type OiController = Controller<OpenInterestModule>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(get_log_file())?;
    init_logging_to(Arc::new(log_file));

    let symbols = get_symbols();
    let upstream_url = get_upstream_url();
    let config = SyncConfig::from_env();
    info!(?symbols, %upstream_url, ?config, "starting open interest dashboard");

    let provider = HttpProvider::new(&upstream_url, upstream_shape(&upstream_url))?;
    let surfaces = SurfaceRegistry::default();
    let engine = Arc::new(TerminalChartEngine::new(surfaces));
    let params = Params::new(symbols.first().map(String::as_str).unwrap_or("BTCUSDT"));

    let controller: Arc<OiController> = Arc::new(
        Controller::builder(
            OpenInterestModule,
            Arc::new(provider),
            engine,
            SurfaceId::from(CHART_SURFACE),
        )
        .params(params)
        .config(config)
        .build(),
    );

    // Setup panic hook to restore terminal on crash
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(
            io::stdout(),
            LeaveAlternateScreen,
            DisableMouseCapture,
            DisableFocusChange
        );
        original_hook(panic_info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture, EnableFocusChange)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Lay out once so the chart surface exists before the first load lands
    let mut attached = false;
    terminal.draw(|f| attached = render_ui(f, &controller.snapshot(), controller.renderer()))?;
    controller.mount();

    let result = run(&mut terminal, &controller, &symbols, attached).await;

    controller.unmount();
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture,
        DisableFocusChange
    )?;
    terminal.show_cursor()?;
    info!("open interest dashboard exited");
    result
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    controller: &Arc<OiController>,
    symbols: &[String],
    mut attached: bool,
) -> Result<(), Box<dyn Error>> {
    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut paused = false;

    loop {
        if last_tick.elapsed() >= tick_rate {
            let snapshot = controller.snapshot();
            let mut now_attached = attached;
            terminal.draw(|f| now_attached = render_ui(f, &snapshot, controller.renderer()))?;

            // Surface came back (eg/ terminal grew): rebuild from the last good data
            if now_attached && !attached && !controller.renderer().has_instance() {
                let controller = Arc::clone(controller);
                tokio::spawn(async move { controller.rerender().await });
            }
            attached = now_attached;
            last_tick = Instant::now();
        }

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        if !event::poll(timeout)? {
            continue;
        }

        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Char('r') => {
                    let controller = Arc::clone(controller);
                    tokio::spawn(async move { controller.refresh().await });
                }
                KeyCode::Char('s') => {
                    let current = controller.params().symbol;
                    if let Some(symbol) = next_symbol(symbols, &current) {
                        controller.set_params(|params| params.symbol = symbol.into());
                    }
                }
                KeyCode::Char('i') => {
                    controller.set_params(|params| params.interval = params.interval.next());
                }
                KeyCode::Char('u') => {
                    controller.set_params(|params| params.unit = params.unit.toggle());
                }
                KeyCode::Char('+') | KeyCode::Char('=') => {
                    controller.set_params(|params| params.range = params.range.widen());
                }
                KeyCode::Char('-') => {
                    controller.set_params(|params| params.range = params.range.narrow());
                }
                KeyCode::Char('p') => {
                    paused = !paused;
                    controller.set_visible(!paused);
                }
                _ => {}
            },
            Event::FocusGained if !paused => controller.set_visible(true),
            Event::FocusLost => controller.set_visible(false),
            _ => {}
        }
    }

    Ok(())
}
