//! Hosted checkout sessions.
//!
//! A checkout targets either a plan (recurring subscription) or a product
//! (one-time credit pack). The engine creates the provider session, persists
//! a `pending` record and later reconciles it: completed plan checkouts
//! materialize exactly one local [`Subscription`], completed product
//! checkouts credit the ledger. Both fulfilments are keyed by the checkout
//! id, so repeated syncs never apply them twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::client::{
    CheckoutLineItem, CheckoutMode, CreateCheckoutSessionParams, CreateSubscriptionParams,
    PaymentProviderClient, PhaseItem,
};
use super::customer::Customer;
use super::debounce::SyncDebouncer;
use super::directory::Directory;
use super::error::{BillingError, Result};
use super::ledger::{Credit, Ledger};
use super::plans::{Plan, PriceUsageType, ProductBehavior};
use super::storage::{BillingStore, CheckoutFilter, SubscriptionFilter};
use super::subscription::{ONBOARD_SOURCE, Subscription, SubscriptionEngine};
use crate::config::{BillingConfig, RedirectConfig};

/// Placeholder in redirect URLs replaced with the generated checkout id.
pub const CHECKOUT_ID_PLACEHOLDER: &str = "{{.CheckoutID}}";

/// Source recorded on credits bought through a product checkout.
pub const PURCHASE_SOURCE: &str = "system.purchase";

/// Checkout lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckoutState {
    #[default]
    Pending,
    Expired,
    Complete,
    Unrecognized(String),
}

impl CheckoutState {
    /// Map a provider session status.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "open" | "pending" => Self::Pending,
            "complete" => Self::Complete,
            "expired" => Self::Expired,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Complete => "complete",
            Self::Unrecognized(s) => s,
        }
    }

    /// Complete and expired checkouts never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Expired)
    }
}

impl From<String> for CheckoutState {
    fn from(value: String) -> Self {
        Self::from_provider(&value)
    }
}

impl From<CheckoutState> for String {
    fn from(value: CheckoutState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CheckoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment status of a checkout session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    Paid,
    #[default]
    Unpaid,
    NoPaymentRequired,
    Unrecognized(String),
}

impl PaymentStatus {
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "paid" => Self::Paid,
            "unpaid" => Self::Unpaid,
            "no_payment_required" => Self::NoPaymentRequired,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Paid => "paid",
            Self::Unpaid => "unpaid",
            Self::NoPaymentRequired => "no_payment_required",
            Self::Unrecognized(s) => s,
        }
    }

    /// Nothing more is owed for the session.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::NoPaymentRequired)
    }
}

impl From<String> for PaymentStatus {
    fn from(value: String) -> Self {
        Self::from_provider(&value)
    }
}

impl From<PaymentStatus> for String {
    fn from(value: PaymentStatus) -> Self {
        value.as_str().to_string()
    }
}

/// A checkout for a plan or a product.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkout {
    pub id: String,
    /// Checkout session id at the provider.
    pub provider_id: String,
    pub customer_id: String,
    /// Set for subscription checkouts.
    pub plan_id: String,
    /// Set for one-time product checkouts.
    pub product_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Hosted page the customer is sent to.
    pub checkout_url: String,
    pub state: CheckoutState,
    pub payment_status: PaymentStatus,
    pub metadata: HashMap<String, String>,
    pub expire_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Checkout {
    /// Checkout for a subscription to `plan_id`.
    #[must_use]
    pub fn for_plan(customer_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            plan_id: plan_id.into(),
            ..Self::default()
        }
    }

    /// Checkout for a one-time purchase of `product_id`.
    #[must_use]
    pub fn for_product(customer_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            product_id: product_id.into(),
            ..Self::default()
        }
    }

    /// Checkout collecting a payment method only.
    #[must_use]
    pub fn for_setup(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_urls(mut self, success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        self.success_url = success_url.into();
        self.cancel_url = cancel_url.into();
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Assign the id and substitute it into the redirect URLs.
    fn assign_id(&mut self, id: String) {
        self.success_url = self.success_url.replace(CHECKOUT_ID_PLACEHOLDER, &id);
        self.cancel_url = self.cancel_url.replace(CHECKOUT_ID_PLACEHOLDER, &id);
        self.id = id;
    }
}

/// Validate a redirect URL against the configured policy.
///
/// Allowed domains match exactly or as a parent domain, so `example.com`
/// admits `app.example.com` but not `notexample.com`.
pub fn validate_redirect_url(policy: &RedirectConfig, url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| BillingError::InvalidRedirectUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    if policy.require_https && parsed.scheme() != "https" {
        return Err(BillingError::InvalidRedirectUrl {
            url: url.to_string(),
            reason: "must use https".to_string(),
        });
    }

    if !policy.allowed_domains.is_empty() {
        let host = parsed.host_str().ok_or_else(|| BillingError::InvalidRedirectUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        let allowed = policy
            .allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));
        if !allowed {
            return Err(BillingError::RedirectDomainNotAllowed {
                domain: host.to_string(),
            });
        }
    }
    Ok(())
}

/// Checkout creation and reconciliation.
#[derive(Clone)]
pub struct CheckoutEngine<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    store: S,
    directory: D,
    client: C,
    ledger: Ledger<S>,
    subscriptions: SubscriptionEngine<S, D, C>,
    config: BillingConfig,
    audit: Arc<dyn BillingAuditLogger>,
    debouncer: SyncDebouncer,
    sync_lock: Arc<Mutex<()>>,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> CheckoutEngine<S, D, C> {
    #[must_use]
    pub fn new(
        store: S,
        directory: D,
        client: C,
        ledger: Ledger<S>,
        subscriptions: SubscriptionEngine<S, D, C>,
        config: BillingConfig,
    ) -> Self {
        let debouncer = SyncDebouncer::new(config.checkout_sync_delay());
        Self {
            store,
            directory,
            client,
            ledger,
            subscriptions,
            config,
            audit: Arc::new(NoOpAuditLogger),
            debouncer,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Create a hosted checkout session and persist it as `pending`.
    pub async fn create(&self, mut checkout: Checkout) -> Result<Checkout> {
        let customer = self.store.get_customer(&checkout.customer_id).await?;
        checkout.assign_id(uuid::Uuid::new_v4().to_string());
        self.validate_urls(&checkout)?;

        let now = super::current_timestamp();
        let expires_at = now + self.config.checkout_session_validity_secs;
        let params = if !checkout.plan_id.is_empty() {
            let plan = self.directory.get_plan(&checkout.plan_id).await?;
            self.ensure_no_active_subscription(&customer, &plan.id).await?;
            checkout
                .metadata
                .insert("plan_name".to_string(), plan.name.clone());
            self.plan_session_params(&customer, &checkout, &plan, expires_at)
                .await?
        } else if !checkout.product_id.is_empty() {
            self.product_session_params(&customer, &mut checkout, expires_at)
                .await?
        } else {
            return Err(BillingError::invalid_detail(
                "checkout needs a plan or a product",
            ));
        };

        let session = self.client.create_checkout_session(params).await?;
        checkout.provider_id = session.id;
        checkout.checkout_url = session.url;
        checkout.state = CheckoutState::from_provider(&session.status);
        checkout.payment_status = PaymentStatus::from_provider(&session.payment_status);
        checkout.expire_at = session.expires_at;
        checkout.created_at = now;
        checkout.updated_at = now;
        self.persist_created(checkout).await
    }

    /// Create a setup-mode session that only collects a payment method.
    pub async fn create_session_for_payment_method(&self, mut checkout: Checkout) -> Result<Checkout> {
        let customer = self.store.get_customer(&checkout.customer_id).await?;
        checkout.assign_id(uuid::Uuid::new_v4().to_string());
        self.validate_urls(&checkout)?;

        let now = super::current_timestamp();
        let session = self
            .client
            .create_checkout_session(CreateCheckoutSessionParams {
                customer_provider_id: customer.provider_id.clone(),
                currency: customer.currency.clone(),
                mode: CheckoutMode::Setup,
                line_items: Vec::new(),
                metadata: self.session_metadata(&customer, &checkout.id),
                subscription_metadata: HashMap::new(),
                subscription_description: None,
                trial_period_days: None,
                success_url: checkout.success_url.clone(),
                cancel_url: checkout.cancel_url.clone(),
                expires_at: now + self.config.checkout_session_validity_secs,
                auto_tax: false,
                allow_promotion_codes: false,
            })
            .await?;

        checkout.provider_id = session.id;
        checkout.checkout_url = session.url;
        checkout.state = CheckoutState::from_provider(&session.status);
        checkout.payment_status = PaymentStatus::from_provider(&session.payment_status);
        checkout.expire_at = session.expires_at;
        checkout
            .metadata
            .insert("mode".to_string(), CheckoutMode::Setup.as_str().to_string());
        checkout.created_at = now;
        checkout.updated_at = now;
        self.persist_created(checkout).await
    }

    /// Subscribe the customer to the checkout's plan directly, without a
    /// hosted session. The customer must already have a payment method.
    pub async fn apply(&self, checkout: Checkout) -> Result<Subscription> {
        let customer = self.store.get_customer(&checkout.customer_id).await?;
        if checkout.plan_id.is_empty() {
            let message = if checkout.product_id.is_empty() {
                "checkout needs a plan or a product"
            } else {
                "applying a product checkout is not supported"
            };
            return Err(BillingError::invalid_detail(message));
        }

        let plan = self.directory.get_plan(&checkout.plan_id).await?;
        self.ensure_no_active_subscription(&customer, &plan.id).await?;
        let members = self.directory.member_count(&customer.org_id).await?;

        let mut items = Vec::new();
        for product in &plan.products {
            if product.behavior == ProductBehavior::Credits {
                continue;
            }
            product.check_seat_limit(members)?;
            for price in plan.interval_prices(product) {
                items.push(PhaseItem {
                    price_provider_id: price.provider_id.clone(),
                    quantity: line_quantity(product.is_per_seat(), price.usage_type, members),
                    metadata: HashMap::from([
                        ("org_id".to_string(), customer.org_id.clone()),
                        ("product_id".to_string(), product.id.clone()),
                    ]),
                });
            }
        }

        let remote = self
            .client
            .create_subscription(CreateSubscriptionParams {
                customer_provider_id: customer.provider_id.clone(),
                currency: customer.currency.clone(),
                items,
                metadata: HashMap::from([
                    ("org_id".to_string(), customer.org_id.clone()),
                    ("managed_by".to_string(), self.config.managed_by.clone()),
                ]),
                trial_period_days: (plan.trial_days > 0).then_some(plan.trial_days),
                auto_tax: self.config.auto_tax,
            })
            .await?;

        let checkout_id = if checkout.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            checkout.id.clone()
        };
        let mut sub = Subscription::new(customer.id.clone(), plan.id.clone())
            .with_provider_id(remote.id.clone())
            .with_metadata("org_id", customer.org_id.clone())
            .with_metadata("delegated", "true")
            .with_metadata("checkout_id", checkout_id);
        sub.mirror_provider(&remote);
        if let Some(trial_end) = sub.trial_ends_at {
            sub.metadata
                .insert("trial_ends_at".to_string(), trial_end.to_string());
        }
        let sub = self.subscriptions.create(sub).await?;

        self.grant_plan_credits(&sub.id, &customer, &plan).await?;
        Ok(sub)
    }

    /// Reconcile every checkout of the customer with the provider and
    /// fulfil the completed ones.
    ///
    /// Serialized per engine. Failures of individual checkouts are joined.
    pub async fn sync_with_provider(&self, customer_id: &str) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        let customer = self.store.get_customer(customer_id).await?;

        let checkouts = self
            .store
            .list_checkouts(CheckoutFilter {
                customer_id: Some(customer.id.clone()),
                ..CheckoutFilter::default()
            })
            .await?;

        let mut errors = Vec::new();
        let mut refreshed = Vec::with_capacity(checkouts.len());
        for checkout in checkouts {
            if checkout.state.is_terminal() {
                refreshed.push(checkout);
                continue;
            }
            let id = checkout.id.clone();
            match self.refresh(checkout).await {
                Ok(checkout) => refreshed.push(checkout),
                Err(e) => {
                    tracing::warn!(
                        target: "tideway::billing::checkout",
                        checkout_id = %id,
                        error = %e,
                        "Checkout refresh failed"
                    );
                    errors.push((id, e));
                }
            }
        }

        for checkout in refreshed
            .iter()
            .filter(|c| c.state == CheckoutState::Complete && c.payment_status.is_settled())
        {
            if let Err(e) = self.fulfil(&customer, checkout).await {
                tracing::warn!(
                    target: "tideway::billing::checkout",
                    checkout_id = %checkout.id,
                    error = %e,
                    "Checkout fulfilment failed"
                );
                errors.push((checkout.id.clone(), e));
            }
        }
        BillingError::join(errors)
    }

    /// Sync the customer owning a provider checkout session (webhook path).
    pub async fn trigger_sync_by_provider_id(&self, session_id: &str) -> Result<()> {
        let checkout = self
            .store
            .list_checkouts(CheckoutFilter {
                provider_id: Some(session_id.to_string()),
                ..CheckoutFilter::default()
            })
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BillingError::CheckoutNotFound {
                id: session_id.to_string(),
            })?;
        self.sync_with_provider(&checkout.customer_id).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Checkout> {
        self.store.get_checkout(id).await
    }

    /// List checkouts from storage, requesting a debounced background sync
    /// when the filter names a customer.
    pub async fn list(&self, filter: CheckoutFilter) -> Result<Vec<Checkout>> {
        if let Some(customer_id) = filter.customer_id.clone() {
            let engine = self.clone();
            self.debouncer.call(move || async move {
                if let Err(e) = engine.sync_with_provider(&customer_id).await {
                    tracing::error!(
                        target: "tideway::billing::checkout",
                        customer_id = %customer_id,
                        error = %e,
                        "Background checkout sync failed"
                    );
                }
            });
        }
        self.store.list_checkouts(filter).await
    }

    /// Pull the provider session state into a non-terminal checkout.
    async fn refresh(&self, mut checkout: Checkout) -> Result<Checkout> {
        let now = super::current_timestamp();
        let before = checkout.clone();

        if checkout.expire_at > 0 && now > checkout.expire_at {
            checkout.state = CheckoutState::Expired;
        } else {
            let session = self.client.get_checkout_session(&checkout.provider_id).await?;
            checkout.state = CheckoutState::from_provider(&session.status);
            checkout.payment_status = PaymentStatus::from_provider(&session.payment_status);
            if let Some(subscription_id) = session.subscription_id.filter(|id| !id.is_empty()) {
                checkout
                    .metadata
                    .insert("provider_subscription_id".to_string(), subscription_id);
            }
            if session.amount_total > 0 {
                checkout
                    .metadata
                    .insert("amount_total".to_string(), session.amount_total.to_string());
                checkout
                    .metadata
                    .insert("currency".to_string(), session.currency);
            }
        }

        if checkout == before {
            return Ok(checkout);
        }
        checkout.updated_at = now;
        let checkout = self.store.update_checkout(checkout).await?;
        tracing::debug!(
            target: "tideway::billing::checkout",
            checkout_id = %checkout.id,
            state = %checkout.state,
            "Checkout updated from provider"
        );
        if checkout.state == CheckoutState::Complete {
            self.audit
                .log(BillingAuditEvent::CheckoutCompleted {
                    customer_id: checkout.customer_id.clone(),
                    checkout_id: checkout.id.clone(),
                })
                .await;
        }
        Ok(checkout)
    }

    async fn fulfil(&self, customer: &Customer, checkout: &Checkout) -> Result<()> {
        if !checkout.plan_id.is_empty() {
            self.ensure_subscription(checkout).await?;
            let plan = self.directory.get_plan(&checkout.plan_id).await?;
            return self.grant_plan_credits(&checkout.id, customer, &plan).await;
        }
        if checkout.product_id.is_empty() {
            return Ok(());
        }

        let product = self.directory.get_product(&checkout.product_id).await?;
        let amount = product.config.credit_amount;
        if amount <= 0 {
            return Ok(());
        }
        let title = if product.title.is_empty() { &product.name } else { &product.title };
        let mut description = format!("addition of {} credits for {}", amount, title);
        if let (Some(total), Some(currency)) = (
            checkout.metadata.get("amount_total"),
            checkout.metadata.get("currency"),
        ) {
            description.push_str(&format!(" at {}[{}]", total, currency));
        }
        let credit = Credit::new(checkout.id.clone(), customer.id.clone(), amount)
            .with_source(PURCHASE_SOURCE)
            .with_description(description);
        ignore_already_applied(self.ledger.add(credit).await)
    }

    /// Materialize the local subscription for a completed plan checkout.
    ///
    /// No-op when a subscription with the provider id already exists.
    async fn ensure_subscription(&self, checkout: &Checkout) -> Result<Subscription> {
        let provider_id = checkout
            .metadata
            .get("provider_subscription_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                BillingError::invalid_detail(format!(
                    "checkout {} has no provider subscription",
                    checkout.id
                ))
            })?;

        match self.subscriptions.get_by_provider_id(provider_id).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let remote = self.client.get_subscription(provider_id).await?;
        let mut sub = Subscription::new(checkout.customer_id.clone(), checkout.plan_id.clone())
            .with_provider_id(provider_id.clone())
            .with_metadata("checkout_id", checkout.id.clone());
        sub.mirror_provider(&remote);
        self.subscriptions.create(sub).await
    }

    /// Credit the plan's starter credits keyed by `transaction_id`.
    async fn grant_plan_credits(&self, transaction_id: &str, customer: &Customer, plan: &Plan) -> Result<()> {
        if plan.on_start_credits <= 0 {
            return Ok(());
        }
        let credit = Credit::new(transaction_id, customer.id.clone(), plan.on_start_credits)
            .with_source(ONBOARD_SOURCE)
            .with_description(format!(
                "addition of {} credits for {}",
                plan.on_start_credits,
                plan.display_title()
            ));
        ignore_already_applied(self.ledger.add(credit).await)
    }

    async fn ensure_no_active_subscription(&self, customer: &Customer, plan_id: &str) -> Result<()> {
        let subs = self
            .store
            .list_subscriptions(SubscriptionFilter {
                customer_id: Some(customer.id.clone()),
                plan_id: Some(plan_id.to_string()),
                ..SubscriptionFilter::default()
            })
            .await?;
        match subs.into_iter().find(|s| !s.state.is_finished()) {
            Some(sub) => Err(BillingError::ActiveConflict {
                subscription_id: sub.id,
                plan_id: plan_id.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn plan_session_params(
        &self,
        customer: &Customer,
        checkout: &Checkout,
        plan: &Plan,
        expires_at: u64,
    ) -> Result<CreateCheckoutSessionParams> {
        let members = self.directory.member_count(&customer.org_id).await?;

        let mut line_items = Vec::new();
        for product in &plan.products {
            if product.behavior == ProductBehavior::Credits {
                continue;
            }
            product.check_seat_limit(members)?;
            for price in plan.interval_prices(product) {
                line_items.push(CheckoutLineItem {
                    price_provider_id: price.provider_id.clone(),
                    quantity: line_quantity(product.is_per_seat(), price.usage_type, members),
                });
            }
        }

        let mut metadata = self.session_metadata(customer, &checkout.id);
        metadata.insert("plan_id".to_string(), plan.id.clone());

        Ok(CreateCheckoutSessionParams {
            customer_provider_id: customer.provider_id.clone(),
            currency: customer.currency.clone(),
            mode: CheckoutMode::Subscription,
            line_items,
            metadata,
            subscription_metadata: self.session_metadata(customer, &checkout.id),
            subscription_description: Some(format!("Checkout for {}", plan.name)),
            trial_period_days: (plan.trial_days > 0).then_some(plan.trial_days),
            success_url: checkout.success_url.clone(),
            cancel_url: checkout.cancel_url.clone(),
            expires_at,
            auto_tax: self.config.auto_tax,
            allow_promotion_codes: true,
        })
    }

    async fn product_session_params(
        &self,
        customer: &Customer,
        checkout: &mut Checkout,
        expires_at: u64,
    ) -> Result<CreateCheckoutSessionParams> {
        let product = self.directory.get_product(&checkout.product_id).await?;
        if product.prices.is_empty() {
            return Err(BillingError::invalid_detail(format!(
                "product {} has no prices",
                product.id
            )));
        }

        let line_items = product
            .prices
            .iter()
            .map(|price| CheckoutLineItem {
                price_provider_id: price.provider_id.clone(),
                quantity: line_quantity(false, price.usage_type, 1),
            })
            .collect();

        let mut metadata = self.session_metadata(customer, &checkout.id);
        metadata.insert("product_name".to_string(), product.name.clone());
        metadata.insert(
            "credit_amount".to_string(),
            product.config.credit_amount.to_string(),
        );
        checkout
            .metadata
            .insert("product_name".to_string(), product.name.clone());

        Ok(CreateCheckoutSessionParams {
            customer_provider_id: customer.provider_id.clone(),
            currency: customer.currency.clone(),
            mode: CheckoutMode::Payment,
            line_items,
            metadata,
            subscription_metadata: HashMap::new(),
            subscription_description: None,
            trial_period_days: None,
            success_url: checkout.success_url.clone(),
            cancel_url: checkout.cancel_url.clone(),
            expires_at,
            auto_tax: self.config.auto_tax,
            allow_promotion_codes: true,
        })
    }

    fn session_metadata(&self, customer: &Customer, checkout_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("org_id".to_string(), customer.org_id.clone()),
            ("checkout_id".to_string(), checkout_id.to_string()),
            ("managed_by".to_string(), self.config.managed_by.clone()),
        ])
    }

    fn validate_urls(&self, checkout: &Checkout) -> Result<()> {
        validate_redirect_url(&self.config.redirect, &checkout.success_url)?;
        validate_redirect_url(&self.config.redirect, &checkout.cancel_url)
    }

    async fn persist_created(&self, checkout: Checkout) -> Result<Checkout> {
        let checkout = self.store.create_checkout(checkout).await?;
        tracing::info!(
            target: "tideway::billing::checkout",
            checkout_id = %checkout.id,
            customer_id = %checkout.customer_id,
            session_id = %checkout.provider_id,
            "Checkout session created"
        );
        self.audit
            .log(BillingAuditEvent::CheckoutCreated {
                customer_id: checkout.customer_id.clone(),
                checkout_id: checkout.id.clone(),
                session_id: checkout.provider_id.clone(),
            })
            .await;
        Ok(checkout)
    }
}

/// Quantity for a line item: members for licensed seat prices, one for other
/// licensed prices, none for metered prices.
fn line_quantity(per_seat: bool, usage_type: PriceUsageType, members: i64) -> Option<i64> {
    match usage_type {
        PriceUsageType::Metered => None,
        PriceUsageType::Licensed if per_seat => Some(members),
        PriceUsageType::Licensed => Some(1),
    }
}

fn ignore_already_applied(result: Result<()>) -> Result<()> {
    match result {
        Err(BillingError::AlreadyApplied { .. }) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::RecordingAuditLogger;
    use crate::billing::client::test::MockProviderClient;
    use crate::billing::directory::test::InMemoryDirectory;
    use crate::billing::plans::{Price, Product};
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::storage::{CheckoutRepository, SubscriptionRepository};
    use crate::billing::subscription::SubscriptionState;
    use std::time::Duration;

    type Engine = CheckoutEngine<InMemoryBillingStore, InMemoryDirectory, MockProviderClient>;

    struct Fixture {
        engine: Engine,
        store: InMemoryBillingStore,
        directory: InMemoryDirectory,
        client: MockProviderClient,
        audit: RecordingAuditLogger,
    }

    fn fixture_with(config: BillingConfig) -> Fixture {
        let store = InMemoryBillingStore::new();
        let directory = InMemoryDirectory::new();
        let client = MockProviderClient::new();
        let audit = RecordingAuditLogger::new();

        store.add_customer(Customer::new("cust_1", "org_1").with_provider_id("cus_1"));
        let plans = [
            Plan::builder("basic")
                .title("Basic")
                .on_start_credits(50)
                .product(
                    Product::builder("basic_base")
                        .price(Price::licensed("price_basic", "month"))
                        .price(Price::licensed("price_basic_yearly", "year"))
                        .plans(["basic"])
                        .build(),
                )
                .product(
                    Product::builder("basic_seats")
                        .per_seat(0)
                        .price(Price::licensed("price_seat_basic", "month"))
                        .plans(["basic"])
                        .build(),
                )
                .product(
                    Product::builder("basic_bonus")
                        .credits(10)
                        .price(Price::licensed("price_bonus", "month"))
                        .build(),
                )
                .build(),
            Plan::builder("pro")
                .trial_days(14)
                .product(
                    Product::builder("pro_seats")
                        .per_seat(5)
                        .price(Price::licensed("price_seat_pro", "month"))
                        .plans(["pro"])
                        .build(),
                )
                .build(),
        ];
        for plan in plans {
            client.register_plan(&plan);
            directory.add_plan(plan);
        }
        directory.add_product(
            Product::builder("pack")
                .credits(100)
                .price(Price::licensed("price_pack", "month"))
                .build(),
        );
        directory.add_product(Product::builder("empty").credits(10).build());

        let ledger = Ledger::new(store.clone());
        let subscriptions = SubscriptionEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            config.clone(),
        );
        let engine = CheckoutEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger,
            subscriptions,
            config,
        )
        .with_audit_logger(Arc::new(audit.clone()));
        Fixture {
            engine,
            store,
            directory,
            client,
            audit,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(BillingConfig::default())
    }

    fn plan_checkout(plan_id: &str) -> Checkout {
        Checkout::for_plan("cust_1", plan_id)
            .with_urls("https://app.example.com/done", "https://app.example.com/cancel")
    }

    async fn balance(f: &Fixture) -> i64 {
        Ledger::new(f.store.clone()).get_balance("cust_1").await.unwrap()
    }

    fn policy(domains: &[&str]) -> RedirectConfig {
        RedirectConfig {
            allowed_domains: domains.iter().map(|d| d.to_string()).collect(),
            ..RedirectConfig::default()
        }
    }

    #[test]
    fn test_url_validation_https_required() {
        let strict = policy(&[]);
        assert!(validate_redirect_url(&strict, "https://example.com/success").is_ok());
        assert!(matches!(
            validate_redirect_url(&strict, "http://example.com/success"),
            Err(BillingError::InvalidRedirectUrl { .. })
        ));

        let relaxed = RedirectConfig {
            require_https: false,
            ..RedirectConfig::default()
        };
        assert!(validate_redirect_url(&relaxed, "http://localhost:3000/success").is_ok());
    }

    #[test]
    fn test_url_validation_invalid_url() {
        let strict = policy(&[]);
        assert!(validate_redirect_url(&strict, "not-a-url").is_err());
        assert!(validate_redirect_url(&strict, "").is_err());
    }

    #[test]
    fn test_url_validation_allowed_domains() {
        let allowed = policy(&["example.com", "app.mysite.com"]);

        assert!(validate_redirect_url(&allowed, "https://example.com/success").is_ok());
        assert!(validate_redirect_url(&allowed, "https://app.mysite.com/cancel").is_ok());
        assert!(validate_redirect_url(&allowed, "https://app.example.com/success").is_ok());
        assert!(validate_redirect_url(&allowed, "https://staging.app.mysite.com/success").is_ok());

        assert_eq!(
            validate_redirect_url(&allowed, "https://evil.com/redirect"),
            Err(BillingError::RedirectDomainNotAllowed {
                domain: "evil.com".to_string()
            })
        );
        assert!(validate_redirect_url(&allowed, "https://notexample.com/success").is_err());
    }

    #[test]
    fn test_url_validation_empty_allowed_list() {
        let open = policy(&[]);
        assert!(validate_redirect_url(&open, "https://example.com/success").is_ok());
        assert!(validate_redirect_url(&open, "https://any-domain.com/path").is_ok());
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(CheckoutState::from_provider("open"), CheckoutState::Pending);
        assert_eq!(CheckoutState::from_provider("complete"), CheckoutState::Complete);
        assert_eq!(
            CheckoutState::from_provider("processing"),
            CheckoutState::Unrecognized("processing".to_string())
        );
        assert!(CheckoutState::Expired.is_terminal());
        assert!(!CheckoutState::Pending.is_terminal());

        assert!(PaymentStatus::NoPaymentRequired.is_settled());
        assert!(!PaymentStatus::Unpaid.is_settled());

        let state: CheckoutState = serde_json::from_str("\"expired\"").unwrap();
        assert_eq!(state, CheckoutState::Expired);
        assert_eq!(serde_json::to_string(&CheckoutState::Pending).unwrap(), "\"pending\"");
    }

    #[tokio::test]
    async fn test_create_plan_checkout() {
        let f = fixture();
        f.directory.set_member_count("org_1", 3);

        let created = f
            .engine
            .create(
                Checkout::for_plan("cust_1", "basic").with_urls(
                    "https://app.example.com/done?checkout={{.CheckoutID}}",
                    "https://app.example.com/cancel",
                ),
            )
            .await
            .unwrap();

        assert_eq!(created.state, CheckoutState::Pending);
        assert!(created.provider_id.starts_with("cs_"));
        assert!(!created.checkout_url.is_empty());
        assert_eq!(
            created.success_url,
            format!("https://app.example.com/done?checkout={}", created.id)
        );
        assert_eq!(created.metadata["plan_name"], "basic");
        assert!(created.expire_at > crate::billing::current_timestamp());

        let params = f.client.last_checkout_params().unwrap();
        assert_eq!(params.mode, CheckoutMode::Subscription);
        assert_eq!(
            params.line_items,
            vec![
                CheckoutLineItem {
                    price_provider_id: "price_basic".to_string(),
                    quantity: Some(1),
                },
                CheckoutLineItem {
                    price_provider_id: "price_seat_basic".to_string(),
                    quantity: Some(3),
                },
            ]
        );
        assert_eq!(params.metadata["plan_id"], "basic");
        assert_eq!(params.metadata["checkout_id"], created.id);
        assert_eq!(params.metadata["managed_by"], "tideway");
        assert_eq!(params.subscription_metadata["checkout_id"], created.id);
        assert_eq!(params.subscription_description.as_deref(), Some("Checkout for basic"));
        assert_eq!(params.trial_period_days, None);
        assert!(params.allow_promotion_codes);

        assert_eq!(
            f.audit.events(),
            vec![BillingAuditEvent::CheckoutCreated {
                customer_id: "cust_1".to_string(),
                checkout_id: created.id.clone(),
                session_id: created.provider_id.clone(),
            }]
        );
    }

    #[tokio::test]
    async fn test_create_passes_trial_days() {
        let f = fixture();
        f.engine.create(plan_checkout("pro")).await.unwrap();
        assert_eq!(f.client.last_checkout_params().unwrap().trial_period_days, Some(14));
    }

    #[tokio::test]
    async fn test_create_rejects_active_subscription_to_plan() {
        let f = fixture();
        let mut existing = Subscription::new("cust_1", "basic").with_state(SubscriptionState::Active);
        existing.id = "sub_1".to_string();
        f.store.create_subscription(existing.clone()).await.unwrap();

        let result = f.engine.create(plan_checkout("basic")).await;
        assert_eq!(
            result,
            Err(BillingError::ActiveConflict {
                subscription_id: "sub_1".to_string(),
                plan_id: "basic".to_string(),
            })
        );

        existing.state = SubscriptionState::Canceled;
        f.store.update_subscription(existing).await.unwrap();
        assert!(f.engine.create(plan_checkout("basic")).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_seat_limit() {
        let f = fixture();
        f.directory.set_member_count("org_1", 6);
        let result = f.engine.create(plan_checkout("pro")).await;
        assert_eq!(
            result,
            Err(BillingError::PerSeatLimitReached { limit: 5, members: 6 })
        );
        assert!(f.store.checkouts().is_empty());
    }

    #[tokio::test]
    async fn test_create_validation_errors() {
        let f = fixture_with(BillingConfig {
            redirect: policy(&["example.com"]),
            ..BillingConfig::default()
        });

        let no_target = Checkout::for_setup("cust_1")
            .with_urls("https://example.com/done", "https://example.com/cancel");
        assert!(matches!(
            f.engine.create(no_target).await,
            Err(BillingError::InvalidDetail { .. })
        ));

        let no_prices = Checkout::for_product("cust_1", "empty")
            .with_urls("https://example.com/done", "https://example.com/cancel");
        assert!(matches!(
            f.engine.create(no_prices).await,
            Err(BillingError::InvalidDetail { .. })
        ));

        let bad_domain = Checkout::for_plan("cust_1", "basic")
            .with_urls("https://evil.com/done", "https://example.com/cancel");
        assert!(matches!(
            f.engine.create(bad_domain).await,
            Err(BillingError::RedirectDomainNotAllowed { .. })
        ));

        let unknown_customer = Checkout::for_plan("cust_404", "basic")
            .with_urls("https://example.com/done", "https://example.com/cancel");
        assert!(matches!(
            f.engine.create(unknown_customer).await,
            Err(BillingError::CustomerNotFound { .. })
        ));
        assert!(f.store.checkouts().is_empty());
    }

    #[tokio::test]
    async fn test_sync_completed_plan_checkout_once() {
        let f = fixture();
        let created = f.engine.create(plan_checkout("basic")).await.unwrap();
        let provider_sub = f.client.complete_session(&created.provider_id).unwrap();

        f.engine.sync_with_provider("cust_1").await.unwrap();
        f.engine.sync_with_provider("cust_1").await.unwrap();

        let checkout = f.engine.get_by_id(&created.id).await.unwrap();
        assert_eq!(checkout.state, CheckoutState::Complete);
        assert_eq!(checkout.payment_status, PaymentStatus::Paid);
        assert_eq!(checkout.metadata["provider_subscription_id"], provider_sub);

        let subs = f.store.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].provider_id, provider_sub);
        assert_eq!(subs[0].plan_id, "basic");
        assert_eq!(subs[0].state, SubscriptionState::Active);
        assert_eq!(subs[0].metadata["checkout_id"], created.id);

        assert_eq!(balance(&f).await, 50);
        let completed = f
            .audit
            .events()
            .into_iter()
            .filter(|e| matches!(e, BillingAuditEvent::CheckoutCompleted { .. }))
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn test_sync_completed_product_checkout_credits() {
        let f = fixture();
        let created = f
            .engine
            .create(
                Checkout::for_product("cust_1", "pack")
                    .with_urls("https://app.example.com/done", "https://app.example.com/cancel"),
            )
            .await
            .unwrap();
        let params = f.client.last_checkout_params().unwrap();
        assert_eq!(params.mode, CheckoutMode::Payment);
        assert_eq!(params.metadata["credit_amount"], "100");
        assert_eq!(created.metadata["product_name"], "pack");

        f.client.complete_session(&created.provider_id);
        f.engine.sync_with_provider("cust_1").await.unwrap();
        f.engine.sync_with_provider("cust_1").await.unwrap();

        assert_eq!(balance(&f).await, 100);
        let tx = Ledger::new(f.store.clone()).get_by_id(&created.id).await.unwrap();
        assert_eq!(tx.source, PURCHASE_SOURCE);
        assert_eq!(tx.description, "addition of 100 credits for pack at 1000[usd]");
        assert!(f.store.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_sync_expires_without_provider_call() {
        let f = fixture();
        let created = f.engine.create(plan_checkout("basic")).await.unwrap();
        let mut stale = created.clone();
        stale.expire_at = 1;
        f.store.update_checkout(stale).await.unwrap();

        f.engine.sync_with_provider("cust_1").await.unwrap();

        let checkout = f.engine.get_by_id(&created.id).await.unwrap();
        assert_eq!(checkout.state, CheckoutState::Expired);
        assert_eq!(f.client.get_session_calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_checkout_is_not_refreshed() {
        let f = fixture();
        let created = f.engine.create(plan_checkout("basic")).await.unwrap();
        f.client.complete_session(&created.provider_id);
        f.engine.sync_with_provider("cust_1").await.unwrap();
        assert_eq!(f.client.get_session_calls(), 1);

        f.client.expire_session(&created.provider_id);
        f.engine.sync_with_provider("cust_1").await.unwrap();

        assert_eq!(f.client.get_session_calls(), 1);
        let checkout = f.engine.get_by_id(&created.id).await.unwrap();
        assert_eq!(checkout.state, CheckoutState::Complete);
    }

    #[tokio::test]
    async fn test_sync_collects_provider_failures() {
        let f = fixture();
        let first = f.engine.create(plan_checkout("basic")).await.unwrap();
        let second = f
            .engine
            .create(
                Checkout::for_product("cust_1", "pack")
                    .with_urls("https://app.example.com/done", "https://app.example.com/cancel"),
            )
            .await
            .unwrap();
        f.client.fail_requests(true);

        let err = f.engine.sync_with_provider("cust_1").await.unwrap_err();
        let mut failed = err.failed_ids();
        failed.sort_unstable();
        let mut expected = vec![first.id.as_str(), second.id.as_str()];
        expected.sort_unstable();
        assert_eq!(failed, expected);
        assert!(f.engine.get_by_id(&first.id).await.unwrap().state == CheckoutState::Pending);
    }

    #[tokio::test]
    async fn test_trigger_sync_by_provider_id() {
        let f = fixture();
        let created = f.engine.create(plan_checkout("basic")).await.unwrap();
        f.client.complete_session(&created.provider_id);

        f.engine
            .trigger_sync_by_provider_id(&created.provider_id)
            .await
            .unwrap();
        assert_eq!(
            f.engine.get_by_id(&created.id).await.unwrap().state,
            CheckoutState::Complete
        );

        assert!(matches!(
            f.engine.trigger_sync_by_provider_id("cs_unknown").await,
            Err(BillingError::CheckoutNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_subscribes_directly() {
        let f = fixture();

        let sub = f.engine.apply(Checkout::for_plan("cust_1", "basic")).await.unwrap();
        assert_eq!(sub.state, SubscriptionState::Active);
        assert_eq!(sub.metadata["delegated"], "true");
        assert_eq!(sub.metadata["org_id"], "org_1");
        assert!(sub.metadata.contains_key("checkout_id"));
        assert_eq!(f.client.create_subscription_calls(), 1);

        let tx = Ledger::new(f.store.clone()).get_by_id(&sub.id).await.unwrap();
        assert_eq!(tx.amount, 50);
        assert_eq!(balance(&f).await, 50);

        assert!(matches!(
            f.engine.apply(Checkout::for_plan("cust_1", "basic")).await,
            Err(BillingError::ActiveConflict { .. })
        ));
        assert!(matches!(
            f.engine.apply(Checkout::for_product("cust_1", "pack")).await,
            Err(BillingError::InvalidDetail { .. })
        ));
    }

    #[tokio::test]
    async fn test_setup_session() {
        let f = fixture();
        let created = f
            .engine
            .create_session_for_payment_method(
                Checkout::for_setup("cust_1")
                    .with_urls("https://app.example.com/done", "https://app.example.com/cancel"),
            )
            .await
            .unwrap();

        let params = f.client.last_checkout_params().unwrap();
        assert_eq!(params.mode, CheckoutMode::Setup);
        assert!(params.line_items.is_empty());
        assert_eq!(created.metadata["mode"], "setup");

        f.client.complete_session(&created.provider_id);
        f.engine.sync_with_provider("cust_1").await.unwrap();
        assert_eq!(
            f.engine.get_by_id(&created.id).await.unwrap().state,
            CheckoutState::Complete
        );
        assert!(f.store.subscriptions().is_empty());
        assert_eq!(balance(&f).await, 0);
    }

    #[tokio::test]
    async fn test_list_triggers_debounced_sync() {
        let f = fixture_with(BillingConfig {
            checkout_sync_delay_ms: 20,
            ..BillingConfig::default()
        });
        let created = f.engine.create(plan_checkout("basic")).await.unwrap();
        f.client.complete_session(&created.provider_id);

        let listed = f
            .engine
            .list(CheckoutFilter {
                customer_id: Some("cust_1".to_string()),
                ..CheckoutFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, CheckoutState::Pending);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.engine.get_by_id(&created.id).await.unwrap().state,
            CheckoutState::Complete
        );
        assert_eq!(f.store.subscriptions().len(), 1);
    }
}
