/// Tracing setup
///
/// `RUST_LOG` wins over the built-in filter. `logging.format = "json"`
/// switches the formatter to one JSON object per line.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSettings};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "shipline_agent=info,shipline_output=info";

/// Installs the global subscriber
pub fn init(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = settings.format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}
