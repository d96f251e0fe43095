// src/logging.rs

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// Log level comes from `RUST_LOG`, defaulting to INFO for this crate.
/// Uses a JSON formatter for structured logging.
pub fn init_subscriber() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "dailywell_ai=info".into()))
        .with(fmt::layer().json())
        .init();

    tracing::info!("Tracing subscriber initialized.");
}
