//! Structured logging initialization.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to this crate. When
/// `file` is non-empty, output is appended there instead of stderr.
pub fn init(level: &str, file: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("stronghold={level}").into());

    let registry = tracing_subscriber::registry().with(filter);

    if file.is_empty() {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        match std::fs::OpenOptions::new().create(true).append(true).open(file) {
            Ok(log_file) => {
                registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_ansi(false)
                            .with_writer(log_file),
                    )
                    .init();
            }
            Err(e) => {
                registry.with(tracing_subscriber::fmt::layer()).init();
                tracing::warn!(file, error = %e, "cannot open log file, using stderr");
            }
        }
    }
}
