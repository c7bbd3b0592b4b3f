//! Workspace billing - subscription billing and workspace entitlements.
//!
//! Plans come from a JSON catalog, are priced per country, and are sold
//! through Stripe. Local subscription rows decide whether a workspace may
//! operate.
//!
//! # Features
//!
//! - **Catalog**: hot-reloaded plan document with per-country prices
//! - **Lifecycle**: create, change, cancel and sync against Stripe
//! - **Access**: rule-based workspace lock decisions with a TTL cache
//! - **Webhooks**: signed Stripe events with idempotent processing
//! - **HTTP**: an Axum router exposing all of the above
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use workspace_billing::ConfigBuilder;
//!
//! # fn main() -> Result<(), workspace_billing::AppError> {
//! workspace_billing::init_tracing();
//!
//! let config = ConfigBuilder::new().from_env().build()?;
//! println!("listening on port {}", config.server.port);
//! # Ok(())
//! # }
//! ```

pub mod billing;
pub mod config;
pub mod error;
pub mod http;
pub mod utils;

pub use config::{Config, ConfigBuilder, Environment};
pub use error::{AppError, Result};
pub use http::{BillingState, billing_router};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing from `RUST_LOG` (default `info`).
///
/// Set `BILLING_LOG_JSON=true` for JSON output.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| utils::parse_flag(&v))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing from a built [`Config`].
///
/// `RUST_LOG` still wins over the configured level when set.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
