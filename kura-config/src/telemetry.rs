use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Quiet defaults with the queue's own targets at info. Override via RUST_LOG.
pub const DEFAULT_DIRECTIVES: &str =
    "info,kura::queue=info,kura::dispatch=info,kura::store=warn,sqlx=warn";

/// Installs the global subscriber. `RUST_LOG` wins over `default_directives`.
/// Calling it twice leaves the first subscriber in place.
pub fn init_tracing(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
