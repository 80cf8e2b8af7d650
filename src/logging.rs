//! # Structured Logging
//!
//! Environment-aware tracing setup. Console output by default; JSON output
//! when `COURIER_LOG_FORMAT=json`, which is what production deployments feed
//! into log shippers.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Safe to call multiple times; later calls are no-ops. If a global
/// subscriber is already installed (embedding applications often set their
/// own), this quietly defers to it.
pub fn init_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = environment();
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level(&environment)));

        let json_output = std::env::var("COURIER_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let result = if json_output {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_target(true).with_filter(filter))
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_filter(filter))
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("global tracing subscriber already installed, reusing it");
        } else {
            tracing::debug!(environment = %environment, "structured logging initialized");
        }
    });
}

fn environment() -> String {
    std::env::var("COURIER_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}
