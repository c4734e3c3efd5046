//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. The configured level is the default;
/// `RUST_LOG` overrides it.
pub fn setup(level: &str, pretty: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gofer={level},gofer_server={level}")));

    if pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
