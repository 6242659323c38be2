pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber (stderr, `RUST_LOG` or the default filter).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .try_init();
}
