use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "wsclone=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

static INIT_ONCE: Once = Once::new();

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init(format: LogFormat) {
    INIT_ONCE.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        // Another subscriber may already be installed (tests, embedding).
        let _ = match format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
    });
}
