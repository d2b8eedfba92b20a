//! tideway-billing - billing core for multi-tenant SaaS
//!
//! Customers buy plans and credit packs through hosted checkouts, hold
//! subscriptions that are reconciled with the payment provider, and spend
//! credits on metered usage. Everything the provider reports arrives through
//! signed webhooks or periodic background sync.
//!
//! # Features
//!
//! - **Ledger**: double-entry credit accounting, idempotent by id, no overdraft
//! - **Checkout**: hosted sessions for plans and credit packs, fulfilled once
//! - **Subscriptions**: cancel, two-phase plan changes, seat quantity sync
//! - **Entitlements**: feature and product gating from active subscriptions
//! - **Webhooks**: multi-secret signature verification and deduplicated dispatch
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tideway_billing::{ConfigBuilder, billing::BillingService};
//!
//! #[tokio::main]
//! async fn main() -> tideway_billing::Result<()> {
//!     tideway_billing::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let billing = BillingService::new(store, directory, client, config.billing);
//!     billing.background.init();
//!
//!     // in the webhook route:
//!     billing.webhooks.billing_webhook(&body, &signature, "stripe").await?;
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod config;
mod error;
pub mod utils;
pub mod webhooks;

pub use config::{
    AccountConfig, BillingConfig, Config, ConfigBuilder, LoggingConfig, PlanChangeConfig,
    RedirectConfig, WebhookConfig,
};
pub use error::{ErrorResponse, Result, TidewayError};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with sensible defaults.
///
/// Call early in `main()`, before building the billing engines.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (e.g. "info", "tideway::billing=debug")
/// - `TIDEWAY_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TIDEWAY_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install_subscriber(env_filter, json_logs);
}

/// Initialize tracing from a loaded [`Config`].
pub fn init_tracing_with_config(config: &Config) {
    install_subscriber(EnvFilter::new(&config.logging.level), config.logging.json);
}

fn install_subscriber(env_filter: EnvFilter, json: bool) {
    // A subscriber may already be installed (tests, embedding apps).
    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
