use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::billing::seats::SeatChangeBehavior;
use crate::utils::{get_env_list_with_prefix, get_env_with_prefix};

/// Main configuration for the billing core
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

/// Billing engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Debounce window for read-triggered checkout syncs.
    #[serde(default = "default_sync_delay_ms")]
    pub checkout_sync_delay_ms: u64,
    /// Debounce window for read-triggered subscription syncs.
    #[serde(default = "default_sync_delay_ms")]
    pub subscription_sync_delay_ms: u64,
    /// Debounce window for read-triggered invoice syncs.
    #[serde(default = "default_sync_delay_ms")]
    pub invoice_sync_delay_ms: u64,
    /// Period of the background reconciliation loop.
    #[serde(default = "default_background_sync_interval_secs")]
    pub background_sync_interval_secs: u64,
    /// Upper bound of the random pause before each customer is synced.
    #[serde(default = "default_background_sync_jitter_ms")]
    pub background_sync_jitter_ms: u64,
    /// How long a hosted checkout session stays open.
    #[serde(default = "default_checkout_session_validity_secs")]
    pub checkout_session_validity_secs: u64,
    #[serde(default)]
    pub seat_change_behavior: SeatChangeBehavior,
    /// Ask the provider to compute tax automatically.
    #[serde(default)]
    pub auto_tax: bool,
    /// Value of the `managed_by` metadata key stamped on provider objects.
    #[serde(default = "default_managed_by")]
    pub managed_by: String,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub plan_change: PlanChangeConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub redirect: RedirectConfig,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            checkout_sync_delay_ms: default_sync_delay_ms(),
            subscription_sync_delay_ms: default_sync_delay_ms(),
            invoice_sync_delay_ms: default_sync_delay_ms(),
            background_sync_interval_secs: default_background_sync_interval_secs(),
            background_sync_jitter_ms: default_background_sync_jitter_ms(),
            checkout_session_validity_secs: default_checkout_session_validity_secs(),
            seat_change_behavior: SeatChangeBehavior::default(),
            auto_tax: false,
            managed_by: default_managed_by(),
            account: AccountConfig::default(),
            plan_change: PlanChangeConfig::default(),
            webhook: WebhookConfig::default(),
            redirect: RedirectConfig::default(),
        }
    }
}

impl BillingConfig {
    pub fn checkout_sync_delay(&self) -> Duration {
        Duration::from_millis(self.checkout_sync_delay_ms)
    }

    pub fn subscription_sync_delay(&self) -> Duration {
        Duration::from_millis(self.subscription_sync_delay_ms)
    }

    pub fn invoice_sync_delay(&self) -> Duration {
        Duration::from_millis(self.invoice_sync_delay_ms)
    }

    pub fn background_sync_interval(&self) -> Duration {
        Duration::from_secs(self.background_sync_interval_secs)
    }
}

/// Account onboarding and credit overdraft settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Free plan new customers are subscribed to. Empty disables it.
    #[serde(default)]
    pub default_plan: String,
    /// One-time credits granted when a customer is onboarded.
    #[serde(default)]
    pub onboard_credits: i64,
    /// Credit product whose first price bills overdrafts. Empty disables
    /// overdraft invoicing.
    #[serde(default)]
    pub credit_overdraft_product: String,
    /// Day of the month overdraft invoices are raised (1-28).
    #[serde(default = "default_credit_overdraft_invoice_day")]
    pub credit_overdraft_invoice_day: u32,
    /// Months added to the invoice day to get the end of the billed range.
    #[serde(default)]
    pub credit_overdraft_invoice_range_shift: i32,
    /// Days the customer has to pay an invoice. 0 keeps the provider default.
    #[serde(default)]
    pub invoice_due_in_days: i64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            default_plan: String::new(),
            onboard_credits: 0,
            credit_overdraft_product: String::new(),
            credit_overdraft_invoice_day: default_credit_overdraft_invoice_day(),
            credit_overdraft_invoice_range_shift: 0,
            invoice_due_in_days: 0,
        }
    }
}

/// Provider-side behavior when a plan changes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanChangeConfig {
    /// Proration for changes that take effect at the next cycle.
    #[serde(default = "default_proration_behavior")]
    pub proration_behavior: String,
    /// Proration for changes that take effect immediately.
    #[serde(default = "default_proration_behavior")]
    pub immediate_proration_behavior: String,
    #[serde(default = "default_collection_method")]
    pub collection_method: String,
}

impl Default for PlanChangeConfig {
    fn default() -> Self {
        Self {
            proration_behavior: default_proration_behavior(),
            immediate_proration_behavior: default_proration_behavior(),
            collection_method: default_collection_method(),
        }
    }
}

/// Inbound provider webhook settings.
#[derive(Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default = "default_supported_providers")]
    pub supported_providers: Vec<String>,
    /// Signing secrets, tried in order. Several are accepted during rotation.
    #[serde(default, skip_serializing)]
    pub secrets: Vec<String>,
    /// Maximum accepted age of a signed timestamp.
    #[serde(default = "default_webhook_tolerance_secs")]
    pub tolerance_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            supported_providers: default_supported_providers(),
            secrets: Vec::new(),
            tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("supported_providers", &self.supported_providers)
            .field("secrets", &format!("[{} redacted]", self.secrets.len()))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

/// Checkout redirect URL policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedirectConfig {
    /// Allowed redirect hosts; subdomains match. Empty allows any host.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_require_https")]
    pub require_https: bool,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            require_https: default_require_https(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_sync_delay_ms() -> u64 {
    2_000
}

fn default_background_sync_interval_secs() -> u64 {
    60
}

fn default_background_sync_jitter_ms() -> u64 {
    800
}

fn default_checkout_session_validity_secs() -> u64 {
    24 * 60 * 60
}

fn default_credit_overdraft_invoice_day() -> u32 {
    1
}

fn default_managed_by() -> String {
    "tideway".to_string()
}

fn default_proration_behavior() -> String {
    "create_prorations".to_string()
}

fn default_collection_method() -> String {
    "charge_automatically".to_string()
}

fn default_supported_providers() -> Vec<String> {
    vec!["stripe".to_string()]
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_require_https() -> bool {
    true
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_billing(mut self, billing: BillingConfig) -> Self {
        self.config.billing = billing;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.billing.webhook.secrets.push(secret.into());
        self
    }

    pub fn with_seat_change_behavior(mut self, behavior: SeatChangeBehavior) -> Self {
        self.config.billing.seat_change_behavior = behavior;
        self
    }

    pub fn with_auto_tax(mut self, enabled: bool) -> Self {
        self.config.billing.auto_tax = enabled;
        self
    }

    pub fn with_allowed_redirect_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.billing.redirect.allowed_domains.push(domain.into());
        self
    }

    /// Load configuration from environment variables with TIDEWAY_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        let billing = &mut self.config.billing;
        if let Some(secrets) = get_env_list_with_prefix("BILLING_WEBHOOK_SECRETS") {
            billing.webhook.secrets = secrets;
        }
        if let Some(providers) = get_env_list_with_prefix("BILLING_SUPPORTED_PROVIDERS") {
            billing.webhook.supported_providers = providers;
        }
        if let Some(tolerance) = get_env_with_prefix("BILLING_WEBHOOK_TOLERANCE_SECS") {
            if let Ok(t) = tolerance.parse() {
                billing.webhook.tolerance_secs = t;
            }
        }
        if let Some(auto_tax) = get_env_with_prefix("BILLING_AUTO_TAX") {
            billing.auto_tax = auto_tax.parse().unwrap_or(false);
        }
        if let Some(behavior) = get_env_with_prefix("BILLING_SEAT_CHANGE_BEHAVIOR") {
            if let Some(b) = SeatChangeBehavior::parse(&behavior) {
                billing.seat_change_behavior = b;
            }
        }
        if let Some(interval) = get_env_with_prefix("BILLING_BACKGROUND_SYNC_INTERVAL_SECS") {
            if let Ok(i) = interval.parse() {
                billing.background_sync_interval_secs = i;
            }
        }
        if let Some(delay) = get_env_with_prefix("BILLING_CHECKOUT_SYNC_DELAY_MS") {
            if let Ok(d) = delay.parse() {
                billing.checkout_sync_delay_ms = d;
            }
        }
        if let Some(delay) = get_env_with_prefix("BILLING_SUBSCRIPTION_SYNC_DELAY_MS") {
            if let Ok(d) = delay.parse() {
                billing.subscription_sync_delay_ms = d;
            }
        }
        if let Some(proration) = get_env_with_prefix("BILLING_PRORATION_BEHAVIOR") {
            billing.plan_change.proration_behavior = proration;
        }
        if let Some(proration) = get_env_with_prefix("BILLING_IMMEDIATE_PRORATION_BEHAVIOR") {
            billing.plan_change.immediate_proration_behavior = proration;
        }
        if let Some(method) = get_env_with_prefix("BILLING_COLLECTION_METHOD") {
            billing.plan_change.collection_method = method;
        }
        if let Some(domains) = get_env_list_with_prefix("BILLING_REDIRECT_DOMAINS") {
            billing.redirect.allowed_domains = domains;
        }
        if let Some(managed_by) = get_env_with_prefix("BILLING_MANAGED_BY") {
            billing.managed_by = managed_by;
        }
        if let Some(delay) = get_env_with_prefix("BILLING_INVOICE_SYNC_DELAY_MS") {
            if let Ok(d) = delay.parse() {
                billing.invoice_sync_delay_ms = d;
            }
        }
        if let Some(plan) = get_env_with_prefix("BILLING_DEFAULT_PLAN") {
            billing.account.default_plan = plan;
        }
        if let Some(credits) = get_env_with_prefix("BILLING_ONBOARD_CREDITS") {
            if let Ok(c) = credits.parse() {
                billing.account.onboard_credits = c;
            }
        }
        if let Some(product) = get_env_with_prefix("BILLING_CREDIT_OVERDRAFT_PRODUCT") {
            billing.account.credit_overdraft_product = product;
        }
        if let Some(day) = get_env_with_prefix("BILLING_CREDIT_OVERDRAFT_INVOICE_DAY") {
            if let Ok(d) = day.parse() {
                billing.account.credit_overdraft_invoice_day = d;
            }
        }
        if let Some(shift) = get_env_with_prefix("BILLING_CREDIT_OVERDRAFT_RANGE_SHIFT") {
            if let Ok(s) = shift.parse() {
                billing.account.credit_overdraft_invoice_range_shift = s;
            }
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if the log level, a sync interval, the plan change
    /// settings, the account settings or the webhook settings are invalid.
    pub fn build(self) -> crate::error::Result<Config> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(crate::error::TidewayError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        let billing = &self.config.billing;
        if billing.background_sync_interval_secs == 0 {
            return Err(crate::error::TidewayError::bad_request(
                "Background sync interval must be greater than 0",
            ));
        }
        if billing.checkout_session_validity_secs == 0 {
            return Err(crate::error::TidewayError::bad_request(
                "Checkout session validity must be greater than 0",
            ));
        }

        let valid_proration = ["create_prorations", "none", "always_invoice"];
        for value in [
            &billing.plan_change.proration_behavior,
            &billing.plan_change.immediate_proration_behavior,
        ] {
            if !valid_proration.contains(&value.as_str()) {
                return Err(crate::error::TidewayError::bad_request(format!(
                    "Invalid proration behavior: {}. Must be one of: {}",
                    value,
                    valid_proration.join(", ")
                )));
            }
        }

        let valid_collection = ["charge_automatically", "send_invoice"];
        if !valid_collection.contains(&billing.plan_change.collection_method.as_str()) {
            return Err(crate::error::TidewayError::bad_request(format!(
                "Invalid collection method: {}. Must be one of: {}",
                billing.plan_change.collection_method,
                valid_collection.join(", ")
            )));
        }

        if !(1..=28).contains(&billing.account.credit_overdraft_invoice_day) {
            return Err(crate::error::TidewayError::bad_request(format!(
                "Invalid credit overdraft invoice day: {}. Must be between 1 and 28",
                billing.account.credit_overdraft_invoice_day
            )));
        }
        if billing.account.onboard_credits < 0 {
            return Err(crate::error::TidewayError::bad_request(
                "Onboard credits cannot be negative",
            ));
        }

        if billing.webhook.supported_providers.is_empty() {
            return Err(crate::error::TidewayError::bad_request(
                "At least one webhook provider must be supported",
            ));
        }
        if billing.webhook.tolerance_secs == 0 {
            return Err(crate::error::TidewayError::bad_request(
                "Webhook tolerance must be greater than 0",
            ));
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.billing.checkout_sync_delay(), Duration::from_secs(2));
        assert_eq!(config.billing.checkout_session_validity_secs, 86_400);
        assert_eq!(config.billing.webhook.supported_providers, vec!["stripe"]);
        assert_eq!(config.billing.webhook.tolerance_secs, 300);
        assert_eq!(config.billing.seat_change_behavior, SeatChangeBehavior::Exact);
    }

    #[test]
    fn test_invalid_log_level() {
        assert!(ConfigBuilder::new().with_log_level("loud").build().is_err());
    }

    #[test]
    fn test_invalid_proration() {
        let mut billing = BillingConfig::default();
        billing.plan_change.proration_behavior = "sometimes".to_string();
        assert!(ConfigBuilder::new().with_billing(billing).build().is_err());
    }

    #[test]
    fn test_invalid_overdraft_invoice_day() {
        let mut billing = BillingConfig::default();
        billing.account.credit_overdraft_invoice_day = 31;
        assert!(ConfigBuilder::new().with_billing(billing).build().is_err());
    }

    #[test]
    fn test_webhook_secrets_redacted_in_debug() {
        let config = ConfigBuilder::new()
            .with_webhook_secret("whsec_super_secret")
            .build()
            .unwrap();
        let debug = format!("{:?}", config.billing.webhook);
        assert!(!debug.contains("whsec_super_secret"));
        assert!(debug.contains("1 redacted"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(
            r#"{"billing": {"auto_tax": true, "seat_change_behavior": "incremental", "account": {"default_plan": "free"}}}"#,
        )
        .unwrap();
        assert!(config.billing.auto_tax);
        assert_eq!(config.billing.seat_change_behavior, SeatChangeBehavior::Incremental);
        assert_eq!(config.billing.background_sync_interval_secs, 60);
        assert_eq!(config.billing.account.default_plan, "free");
        assert_eq!(config.billing.account.credit_overdraft_invoice_day, 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_env() {
        unsafe {
            std::env::set_var("TIDEWAY_BILLING_WEBHOOK_SECRETS", "whsec_a, whsec_b");
            std::env::set_var("TIDEWAY_BILLING_SEAT_CHANGE_BEHAVIOR", "incremental");
            std::env::set_var("TIDEWAY_BILLING_DEFAULT_PLAN", "starter");
        }
        let config = ConfigBuilder::new().from_env().build().unwrap();
        unsafe {
            std::env::remove_var("TIDEWAY_BILLING_WEBHOOK_SECRETS");
            std::env::remove_var("TIDEWAY_BILLING_SEAT_CHANGE_BEHAVIOR");
            std::env::remove_var("TIDEWAY_BILLING_DEFAULT_PLAN");
        }
        assert_eq!(config.billing.webhook.secrets, vec!["whsec_a", "whsec_b"]);
        assert_eq!(config.billing.seat_change_behavior, SeatChangeBehavior::Incremental);
        assert_eq!(config.billing.account.default_plan, "starter");
    }
}
