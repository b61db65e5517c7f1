use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Wire up the global tracing subscriber. `RELAYD_LOG` overrides the
/// configured level with a full filter expression.
pub fn init(format: &str, level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(
        std::env::var("RELAYD_LOG")
            .as_deref()
            .unwrap_or(level),
    )?;

    let layer = fmt::layer().with_writer(std::io::stderr);
    match format {
        "logfmt" => tracing_subscriber::registry()
            .with(layer.compact().with_filter(filter))
            .init(),
        _ => tracing_subscriber::registry()
            .with(layer.json().with_filter(filter))
            .init(),
    }

    Ok(())
}
