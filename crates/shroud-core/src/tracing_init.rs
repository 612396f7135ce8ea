//! Process-wide log setup shared by the Shroud binaries.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Output goes to stderr;
/// `log_json` switches to one JSON object per event. Fails if a subscriber
/// is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry
            .with(layer.json().with_current_span(false))
            .try_init()
    } else {
        registry.with(layer.with_target(false)).try_init()
    }
}

/// Default filter: the given crates at `level`, everything else at warn.
pub fn default_filter(crates: &[&str], level: &str) -> String {
    let mut filter = String::from("warn");
    for name in crates {
        filter.push(',');
        filter.push_str(&name.replace('-', "_"));
        filter.push('=');
        filter.push_str(level);
    }
    filter
}
