use anyhow::Context as _;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking writer alive for the lifetime of the service.
pub struct LoggerGuard {
    _stdio_guard: WorkerGuard,
}

pub fn init(filtering_directives: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(std::io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = match filtering_directives {
        Some(directives) => EnvFilter::try_new(directives).context("invalid filtering directives")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _stdio_guard: stdio_guard,
    })
}
