use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialise a stdout `tracing` subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

/// Initialise a `tracing` subscriber writing to `writer`, eg/ a log file behind a TUI's
/// alternate screen.
pub fn init_logging_to<W>(writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(writer)
        .init();
}
