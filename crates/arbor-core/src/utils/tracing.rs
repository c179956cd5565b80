use chrono::Local;
use std::io;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Initialize tracing with a per-run log file under `~/.arbor/logs`.
/// The filter comes from the RUST_LOG environment variable.
pub fn init_tracing() -> io::Result<()> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let filter = EnvFilter::from_default_env();

    if let Some(home_dir) = dirs::home_dir() {
        let log_dir = home_dir.join(".arbor").join("logs");
        std::fs::create_dir_all(&log_dir)?;

        let file_name = format!("{timestamp}.log");
        let file_appender = rolling::never(&log_dir, &file_name);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::new()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "arbor::utils::tracing",
            path = %log_dir.join(&file_name).display(),
            "Tracing initialized with file output"
        );
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::Layer::default()
                    .with_writer(io::stderr)
                    .with_target(true),
            )
            .with(filter);

        tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

        tracing::debug!(
            target: "arbor::utils::tracing",
            "Tracing initialized with stderr output"
        );
    }

    Ok(())
}
