use tracing::Level;
use tracing_subscriber::EnvFilter;

/**
 * Installs a console subscriber for the crate's tracing events. `RUST_LOG`
 * wins over `level` when it is set. Fails if a global subscriber was already
 * installed.
 *
 * # Arguments
 *
 * `level` - Level used when `RUST_LOG` is not set.
 */
pub fn init_tracing(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
}
