//! Tracing setup.
//!
//! The library only emits `tracing` events; applications choose the
//! subscriber. [`init`] installs a reasonable default and is safe to call
//! more than once.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install an `EnvFilter` + fmt subscriber (`RUST_LOG`, default `harbor=info`).
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "harbor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
