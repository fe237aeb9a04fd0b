//! Tracing setup. Phase spans and per-item debug events go to stderr, gated by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
