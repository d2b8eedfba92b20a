//! Payment provider client abstraction.
//!
//! The billing core talks to the provider only through these traits. The
//! types mirror the subset of the provider's checkout session, subscription,
//! subscription schedule, customer and invoice resources the engines read or
//! write.
//! Status fields stay raw strings here and are mapped to local enums by the
//! engines.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// Hosted checkout session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    /// Start a recurring subscription.
    Subscription,
    /// One-time payment.
    Payment,
    /// Collect a payment method without charging.
    Setup,
}

impl CheckoutMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Payment => "payment",
            Self::Setup => "setup",
        }
    }
}

/// Line item of a checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutLineItem {
    pub price_provider_id: String,
    /// `None` for metered prices.
    pub quantity: Option<i64>,
}

/// Parameters for creating a hosted checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckoutSessionParams {
    pub customer_provider_id: String,
    pub currency: String,
    pub mode: CheckoutMode,
    pub line_items: Vec<CheckoutLineItem>,
    pub metadata: HashMap<String, String>,
    /// Metadata copied onto the subscription the session creates.
    pub subscription_metadata: HashMap<String, String>,
    pub subscription_description: Option<String>,
    pub trial_period_days: Option<i64>,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: u64,
    pub auto_tax: bool,
    pub allow_promotion_codes: bool,
}

/// A checkout session as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCheckoutSession {
    pub id: String,
    pub url: String,
    /// "open", "complete" or "expired".
    pub status: String,
    /// "paid", "unpaid" or "no_payment_required".
    pub payment_status: String,
    /// Subscription created by the session, once complete.
    pub subscription_id: Option<String>,
    pub amount_total: i64,
    pub currency: String,
    pub expires_at: u64,
    pub customer_provider_id: String,
}

/// One item of a provider subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscriptionItem {
    pub id: String,
    pub price_provider_id: String,
    pub product_provider_id: String,
    /// Recurring interval of the price ("month", "year").
    pub interval: String,
    pub quantity: i64,
    pub metadata: HashMap<String, String>,
}

/// A subscription as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_provider_id: String,
    pub status: String,
    pub canceled_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub trial_end: Option<u64>,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub billing_cycle_anchor: u64,
    pub schedule_id: Option<String>,
    pub items: Vec<ProviderSubscriptionItem>,
    pub auto_tax: bool,
    pub metadata: HashMap<String, String>,
}

/// Price/quantity pair inside a schedule phase or new subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseItem {
    pub price_provider_id: String,
    pub quantity: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Start and end of the schedule phase currently in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseWindow {
    pub start_date: u64,
    pub end_date: u64,
}

/// A phase of a subscription schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePhase {
    pub items: Vec<PhaseItem>,
    pub currency: String,
    pub start_date: u64,
    pub end_date: u64,
    pub metadata: HashMap<String, String>,
    pub auto_tax: bool,
}

impl SchedulePhase {
    /// Re-submit this phase unchanged in a schedule update.
    #[must_use]
    pub fn to_params(&self) -> SchedulePhaseParams {
        SchedulePhaseParams {
            items: self.items.clone(),
            currency: self.currency.clone(),
            start_date: Some(self.start_date),
            end: PhaseEnd::At(self.end_date),
            metadata: self.metadata.clone(),
            auto_tax: self.auto_tax,
        }
    }
}

/// What happens when the last phase of a schedule ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleEndBehavior {
    /// Subscription continues without a schedule.
    #[default]
    Release,
    /// Subscription is canceled.
    Cancel,
}

/// A subscription schedule as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSchedule {
    pub id: String,
    pub subscription_id: String,
    pub current_phase: Option<PhaseWindow>,
    pub phases: Vec<SchedulePhase>,
    pub end_behavior: ScheduleEndBehavior,
}

impl ProviderSchedule {
    /// The phase whose start matches the current window.
    #[must_use]
    pub fn active_phase(&self) -> Option<&SchedulePhase> {
        let current = self.current_phase?;
        self.phases.iter().find(|p| p.start_date == current.start_date)
    }

    /// The first phase starting at or after the current window ends.
    #[must_use]
    pub fn next_phase(&self) -> Option<&SchedulePhase> {
        let current = self.current_phase?;
        self.phases.iter().find(|p| p.start_date >= current.end_date)
    }
}

/// Where a schedule phase ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEnd {
    /// End immediately.
    Now,
    /// End at a unix timestamp.
    At(u64),
    /// Run for this many billing intervals.
    Iterations(u32),
}

/// A phase in a schedule update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePhaseParams {
    pub items: Vec<PhaseItem>,
    pub currency: String,
    /// `None` keeps the existing start (first phase) or follows the previous phase.
    pub start_date: Option<u64>,
    pub end: PhaseEnd,
    pub metadata: HashMap<String, String>,
    pub auto_tax: bool,
}

/// Replacement phase list for a subscription schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateScheduleParams {
    pub phases: Vec<SchedulePhaseParams>,
    pub end_behavior: ScheduleEndBehavior,
    pub proration_behavior: String,
    pub collection_method: String,
}

/// Quantity change for one subscription item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItemUpdate {
    pub id: String,
    pub quantity: i64,
}

/// Parameters for updating subscription item quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSubscriptionItemsParams {
    pub items: Vec<SubscriptionItemUpdate>,
    pub proration_behavior: String,
    /// Invoice pending items on this interval instead of at renewal.
    pub pending_invoice_item_interval: Option<String>,
}

/// Parameters for creating a subscription without a hosted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubscriptionParams {
    pub customer_provider_id: String,
    pub currency: String,
    pub items: Vec<PhaseItem>,
    pub metadata: HashMap<String, String>,
    pub trial_period_days: Option<i64>,
    pub auto_tax: bool,
}

/// Parameters for an immediate cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSubscriptionParams {
    pub invoice_now: bool,
    pub prorate: bool,
}

/// A customer as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub currency: String,
    pub deleted: bool,
}

/// Line of a provider invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInvoiceLine {
    pub id: String,
    pub description: String,
    pub quantity: i64,
    pub unit_amount: i64,
    pub metadata: HashMap<String, String>,
    pub period_start: Option<u64>,
    pub period_end: Option<u64>,
}

/// An invoice as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub customer_provider_id: String,
    /// Raw provider status (`draft`, `open`, `paid`, `void`, `uncollectible`).
    pub status: String,
    pub currency: String,
    /// Total in the smallest currency unit.
    pub total: i64,
    pub hosted_url: String,
    pub metadata: HashMap<String, String>,
    pub lines: Vec<ProviderInvoiceLine>,
    /// When the invoice was finalized. `None` while it is a draft.
    pub effective_at: Option<u64>,
    pub due_date: Option<u64>,
    pub next_payment_attempt: Option<u64>,
    pub created: u64,
    pub period_start: u64,
    pub period_end: u64,
}

/// One item of an invoice to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItemParams {
    pub unit_amount: i64,
    pub quantity: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
    /// Billed period as `(start, end)`.
    pub period: Option<(u64, u64)>,
}

/// Parameters for creating and finalizing a one-off invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoiceParams {
    pub customer_provider_id: String,
    pub currency: String,
    pub description: String,
    pub days_until_due: Option<i64>,
    pub auto_tax: bool,
    pub metadata: HashMap<String, String>,
    pub items: Vec<InvoiceItemParams>,
}

/// Checkout session operations.
#[async_trait]
pub trait ProviderCheckoutClient: Send + Sync {
    async fn create_checkout_session(
        &self,
        params: CreateCheckoutSessionParams,
    ) -> Result<ProviderCheckoutSession>;

    async fn get_checkout_session(&self, session_id: &str) -> Result<ProviderCheckoutSession>;
}

/// Subscription and subscription schedule operations.
#[async_trait]
pub trait ProviderSubscriptionClient: Send + Sync {
    async fn create_subscription(&self, params: CreateSubscriptionParams) -> Result<ProviderSubscription>;

    /// Returns `BillingError::SubscriptionOnProviderNotFound` when unknown.
    async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;

    async fn update_subscription_items(
        &self,
        subscription_id: &str,
        params: UpdateSubscriptionItemsParams,
    ) -> Result<ProviderSubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        params: CancelSubscriptionParams,
    ) -> Result<ProviderSubscription>;

    /// Create a schedule that mirrors the subscription's current phase.
    async fn create_schedule_from_subscription(&self, subscription_id: &str) -> Result<ProviderSchedule>;

    async fn get_schedule(&self, schedule_id: &str) -> Result<ProviderSchedule>;

    async fn update_schedule(
        &self,
        schedule_id: &str,
        params: UpdateScheduleParams,
    ) -> Result<ProviderSchedule>;
}

/// Customer operations.
#[async_trait]
pub trait ProviderCustomerClient: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer>;
}

/// Invoice operations.
#[async_trait]
pub trait ProviderInvoiceClient: Send + Sync {
    async fn list_invoices(&self, customer_provider_id: &str) -> Result<Vec<ProviderInvoice>>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<ProviderInvoice>;

    /// Preview of the next invoice. `None` when nothing is due.
    async fn get_upcoming_invoice(&self, customer_provider_id: &str) -> Result<Option<ProviderInvoice>>;

    /// Create the invoice with its items and finalize it.
    async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<ProviderInvoice>;
}

/// A type that implements every provider client trait.
///
/// Engines take this bound and clone the client into background syncs.
pub trait PaymentProviderClient:
    ProviderCheckoutClient
    + ProviderSubscriptionClient
    + ProviderCustomerClient
    + ProviderInvoiceClient
    + Clone
    + 'static
{
}

impl<T> PaymentProviderClient for T where
    T: ProviderCheckoutClient
        + ProviderSubscriptionClient
        + ProviderCustomerClient
        + ProviderInvoiceClient
        + Clone
        + 'static
{
}

/// Length of one billing interval in seconds.
#[must_use]
pub fn interval_seconds(interval: &str) -> u64 {
    match interval {
        "year" => 365 * 86_400,
        "week" => 7 * 86_400,
        "day" => 86_400,
        _ => 30 * 86_400,
    }
}

/// Mock provider client for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::current_timestamp;
    use crate::billing::error::BillingError;
    use crate::billing::plans::Plan;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory provider that keeps sessions, subscriptions and schedules.
    ///
    /// Sessions are created `open`; tests drive them with
    /// [`MockProviderClient::complete_session`] and
    /// [`MockProviderClient::expire_session`].
    #[derive(Default, Clone)]
    pub struct MockProviderClient {
        inner: Arc<MockProviderInner>,
    }

    #[derive(Default)]
    struct MockProviderInner {
        counter: AtomicU64,
        sessions: RwLock<HashMap<String, ProviderCheckoutSession>>,
        session_params: RwLock<HashMap<String, CreateCheckoutSessionParams>>,
        subscriptions: RwLock<HashMap<String, ProviderSubscription>>,
        schedules: RwLock<HashMap<String, ProviderSchedule>>,
        customers: RwLock<HashMap<String, ProviderCustomer>>,
        invoices: RwLock<HashMap<String, ProviderInvoice>>,
        /// customer provider id -> upcoming invoice
        upcoming: RwLock<HashMap<String, ProviderInvoice>>,
        created_invoices: RwLock<Vec<CreateInvoiceParams>>,
        /// price provider id -> (product provider id, interval)
        prices: RwLock<HashMap<String, (String, String)>>,
        last_checkout_params: RwLock<Option<CreateCheckoutSessionParams>>,
        last_schedule_update: RwLock<Option<UpdateScheduleParams>>,
        item_updates: RwLock<Vec<(String, UpdateSubscriptionItemsParams)>>,
        get_session_calls: AtomicU64,
        create_subscription_calls: AtomicU64,
        cancel_calls: AtomicU64,
        fail: AtomicBool,
    }

    impl MockProviderClient {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{}_{}", prefix, self.inner.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn check_fail(&self, operation: &str) -> Result<()> {
            if self.inner.fail.load(Ordering::SeqCst) {
                return Err(BillingError::provider(operation, "mock provider failure"));
            }
            Ok(())
        }

        pub fn insert_invoice(&self, invoice: ProviderInvoice) {
            self.inner
                .invoices
                .write()
                .unwrap()
                .insert(invoice.id.clone(), invoice);
        }

        pub fn invoice(&self, id: &str) -> Option<ProviderInvoice> {
            self.inner.invoices.read().unwrap().get(id).cloned()
        }

        /// Change an invoice status, stamping `effective_at` on finalization.
        pub fn set_invoice_status(&self, id: &str, status: &str) {
            if let Some(invoice) = self.inner.invoices.write().unwrap().get_mut(id) {
                invoice.status = status.to_string();
                if status != "draft" && invoice.effective_at.is_none() {
                    invoice.effective_at = Some(current_timestamp());
                }
            }
        }

        pub fn set_upcoming_invoice(&self, customer_provider_id: &str, invoice: ProviderInvoice) {
            self.inner
                .upcoming
                .write()
                .unwrap()
                .insert(customer_provider_id.to_string(), invoice);
        }

        /// Parameters of every `create_invoice` call, oldest first.
        pub fn created_invoices(&self) -> Vec<CreateInvoiceParams> {
            self.inner.created_invoices.read().unwrap().clone()
        }

        /// Make every call fail with a provider error.
        pub fn fail_requests(&self, fail: bool) {
            self.inner.fail.store(fail, Ordering::SeqCst);
        }

        /// Teach the mock which product and interval each of the plan's prices belongs to.
        pub fn register_plan(&self, plan: &Plan) {
            let mut prices = self.inner.prices.write().unwrap();
            for product in &plan.products {
                for price in &product.prices {
                    prices.insert(
                        price.provider_id.clone(),
                        (product.provider_id.clone(), price.interval.clone()),
                    );
                }
            }
        }

        pub fn set_customer(&self, customer: ProviderCustomer) {
            self.inner
                .customers
                .write()
                .unwrap()
                .insert(customer.id.clone(), customer);
        }

        /// Insert or replace a provider subscription.
        pub fn insert_subscription(&self, subscription: ProviderSubscription) {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(subscription.id.clone(), subscription);
        }

        pub fn subscription(&self, id: &str) -> Option<ProviderSubscription> {
            self.inner.subscriptions.read().unwrap().get(id).cloned()
        }

        pub fn schedule(&self, id: &str) -> Option<ProviderSchedule> {
            self.inner.schedules.read().unwrap().get(id).cloned()
        }

        pub fn set_subscription_status(&self, id: &str, status: &str) {
            if let Some(sub) = self.inner.subscriptions.write().unwrap().get_mut(id) {
                sub.status = status.to_string();
            }
        }

        /// Mark the session complete and paid, creating its subscription
        /// for subscription-mode sessions. Returns the subscription id.
        pub fn complete_session(&self, session_id: &str) -> Option<String> {
            let params = self.inner.session_params.read().unwrap().get(session_id).cloned()?;
            let subscription_id = match params.mode {
                CheckoutMode::Subscription => {
                    let items = params
                        .line_items
                        .iter()
                        .map(|li| PhaseItem {
                            price_provider_id: li.price_provider_id.clone(),
                            quantity: li.quantity,
                            metadata: HashMap::new(),
                        })
                        .collect();
                    let subscription = self.build_subscription(
                        &params.customer_provider_id,
                        items,
                        params.subscription_metadata.clone(),
                        params.trial_period_days,
                    );
                    let id = subscription.id.clone();
                    self.insert_subscription(subscription);
                    Some(id)
                }
                _ => None,
            };

            let mut sessions = self.inner.sessions.write().unwrap();
            let session = sessions.get_mut(session_id)?;
            session.status = "complete".to_string();
            session.payment_status = "paid".to_string();
            session.subscription_id = subscription_id.clone();
            session.amount_total = 1_000;
            subscription_id
        }

        pub fn expire_session(&self, session_id: &str) {
            if let Some(session) = self.inner.sessions.write().unwrap().get_mut(session_id) {
                session.status = "expired".to_string();
            }
        }

        pub fn get_session_calls(&self) -> u64 {
            self.inner.get_session_calls.load(Ordering::SeqCst)
        }

        pub fn create_subscription_calls(&self) -> u64 {
            self.inner.create_subscription_calls.load(Ordering::SeqCst)
        }

        pub fn cancel_calls(&self) -> u64 {
            self.inner.cancel_calls.load(Ordering::SeqCst)
        }

        pub fn last_checkout_params(&self) -> Option<CreateCheckoutSessionParams> {
            self.inner.last_checkout_params.read().unwrap().clone()
        }

        pub fn last_schedule_update(&self) -> Option<UpdateScheduleParams> {
            self.inner.last_schedule_update.read().unwrap().clone()
        }

        pub fn item_updates(&self) -> Vec<(String, UpdateSubscriptionItemsParams)> {
            self.inner.item_updates.read().unwrap().clone()
        }

        fn build_subscription(
            &self,
            customer_provider_id: &str,
            items: Vec<PhaseItem>,
            metadata: HashMap<String, String>,
            trial_period_days: Option<i64>,
        ) -> ProviderSubscription {
            let now = current_timestamp();
            let prices = self.inner.prices.read().unwrap();
            let items: Vec<ProviderSubscriptionItem> = items
                .into_iter()
                .map(|item| {
                    let (product, interval) = prices
                        .get(&item.price_provider_id)
                        .cloned()
                        .unwrap_or_else(|| (String::new(), "month".to_string()));
                    ProviderSubscriptionItem {
                        id: self.next_id("si"),
                        price_provider_id: item.price_provider_id,
                        product_provider_id: product,
                        interval,
                        quantity: item.quantity.unwrap_or(0),
                        metadata: item.metadata,
                    }
                })
                .collect();
            let period = items
                .first()
                .map(|i| interval_seconds(&i.interval))
                .unwrap_or_else(|| interval_seconds("month"));
            let trial_end = trial_period_days
                .filter(|d| *d > 0)
                .map(|d| now + d as u64 * 86_400);
            ProviderSubscription {
                id: self.next_id("sub"),
                customer_provider_id: customer_provider_id.to_string(),
                status: if trial_end.is_some() { "trialing" } else { "active" }.to_string(),
                trial_end,
                current_period_start: now,
                current_period_end: now + period,
                billing_cycle_anchor: now,
                items,
                metadata,
                ..ProviderSubscription::default()
            }
        }
    }

    #[async_trait]
    impl ProviderCheckoutClient for MockProviderClient {
        async fn create_checkout_session(
            &self,
            params: CreateCheckoutSessionParams,
        ) -> Result<ProviderCheckoutSession> {
            self.check_fail("create checkout session")?;
            let id = self.next_id("cs");
            let session = ProviderCheckoutSession {
                id: id.clone(),
                url: format!("https://checkout.example.com/{}", id),
                status: "open".to_string(),
                payment_status: "unpaid".to_string(),
                subscription_id: None,
                amount_total: 0,
                currency: params.currency.clone(),
                expires_at: params.expires_at,
                customer_provider_id: params.customer_provider_id.clone(),
            };
            self.inner.sessions.write().unwrap().insert(id.clone(), session.clone());
            self.inner.session_params.write().unwrap().insert(id, params.clone());
            *self.inner.last_checkout_params.write().unwrap() = Some(params);
            Ok(session)
        }

        async fn get_checkout_session(&self, session_id: &str) -> Result<ProviderCheckoutSession> {
            self.inner.get_session_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail("get checkout session")?;
            self.inner
                .sessions
                .read()
                .unwrap()
                .get(session_id)
                .cloned()
                .ok_or_else(|| BillingError::provider("get checkout session", "no such session"))
        }
    }

    #[async_trait]
    impl ProviderSubscriptionClient for MockProviderClient {
        async fn create_subscription(&self, params: CreateSubscriptionParams) -> Result<ProviderSubscription> {
            self.inner.create_subscription_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail("create subscription")?;
            let subscription = self.build_subscription(
                &params.customer_provider_id,
                params.items,
                params.metadata,
                params.trial_period_days,
            );
            self.insert_subscription(subscription.clone());
            Ok(subscription)
        }

        async fn get_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
            self.check_fail("get subscription")?;
            self.subscription(subscription_id)
                .ok_or_else(|| BillingError::SubscriptionOnProviderNotFound {
                    provider_id: subscription_id.to_string(),
                })
        }

        async fn update_subscription_items(
            &self,
            subscription_id: &str,
            params: UpdateSubscriptionItemsParams,
        ) -> Result<ProviderSubscription> {
            self.check_fail("update subscription")?;
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let sub = subscriptions.get_mut(subscription_id).ok_or_else(|| {
                BillingError::SubscriptionOnProviderNotFound {
                    provider_id: subscription_id.to_string(),
                }
            })?;
            for update in &params.items {
                if let Some(item) = sub.items.iter_mut().find(|i| i.id == update.id) {
                    item.quantity = update.quantity;
                }
            }
            self.inner
                .item_updates
                .write()
                .unwrap()
                .push((subscription_id.to_string(), params));
            Ok(sub.clone())
        }

        async fn cancel_subscription(
            &self,
            subscription_id: &str,
            _params: CancelSubscriptionParams,
        ) -> Result<ProviderSubscription> {
            self.inner.cancel_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fail("cancel subscription")?;
            let now = current_timestamp();
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let sub = subscriptions.get_mut(subscription_id).ok_or_else(|| {
                BillingError::SubscriptionOnProviderNotFound {
                    provider_id: subscription_id.to_string(),
                }
            })?;
            sub.status = "canceled".to_string();
            sub.canceled_at = Some(now);
            sub.ended_at = Some(now);
            sub.schedule_id = None;
            Ok(sub.clone())
        }

        async fn create_schedule_from_subscription(&self, subscription_id: &str) -> Result<ProviderSchedule> {
            self.check_fail("create subscription schedule")?;
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let sub = subscriptions.get_mut(subscription_id).ok_or_else(|| {
                BillingError::SubscriptionOnProviderNotFound {
                    provider_id: subscription_id.to_string(),
                }
            })?;
            let schedule = ProviderSchedule {
                id: self.next_id("sub_sched"),
                subscription_id: subscription_id.to_string(),
                current_phase: Some(PhaseWindow {
                    start_date: sub.current_period_start,
                    end_date: sub.current_period_end,
                }),
                phases: vec![SchedulePhase {
                    items: sub
                        .items
                        .iter()
                        .map(|i| PhaseItem {
                            price_provider_id: i.price_provider_id.clone(),
                            quantity: Some(i.quantity),
                            metadata: i.metadata.clone(),
                        })
                        .collect(),
                    currency: "usd".to_string(),
                    start_date: sub.current_period_start,
                    end_date: sub.current_period_end,
                    metadata: HashMap::new(),
                    auto_tax: sub.auto_tax,
                }],
                end_behavior: ScheduleEndBehavior::Release,
            };
            sub.schedule_id = Some(schedule.id.clone());
            self.inner
                .schedules
                .write()
                .unwrap()
                .insert(schedule.id.clone(), schedule.clone());
            Ok(schedule)
        }

        async fn get_schedule(&self, schedule_id: &str) -> Result<ProviderSchedule> {
            self.check_fail("get subscription schedule")?;
            self.schedule(schedule_id)
                .ok_or_else(|| BillingError::provider("get subscription schedule", "no such schedule"))
        }

        async fn update_schedule(
            &self,
            schedule_id: &str,
            params: UpdateScheduleParams,
        ) -> Result<ProviderSchedule> {
            self.check_fail("update subscription schedule")?;
            let now = current_timestamp();
            let mut schedules = self.inner.schedules.write().unwrap();
            let schedule = schedules
                .get_mut(schedule_id)
                .ok_or_else(|| BillingError::provider("update subscription schedule", "no such schedule"))?;

            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let sub = subscriptions.get_mut(&schedule.subscription_id).ok_or_else(|| {
                BillingError::SubscriptionOnProviderNotFound {
                    provider_id: schedule.subscription_id.clone(),
                }
            })?;
            let period = sub
                .items
                .first()
                .map(|i| interval_seconds(&i.interval))
                .unwrap_or_else(|| interval_seconds("month"));

            let first_start = schedule
                .current_phase
                .map(|w| w.start_date)
                .unwrap_or(sub.current_period_start);
            let mut phases = Vec::with_capacity(params.phases.len());
            let mut cursor = first_start;
            for (idx, p) in params.phases.iter().enumerate() {
                let start = p
                    .start_date
                    .unwrap_or(if idx == 0 { first_start } else { cursor });
                let end = match p.end {
                    PhaseEnd::Now => now,
                    PhaseEnd::At(at) => at,
                    PhaseEnd::Iterations(n) => start + u64::from(n) * period,
                };
                phases.push(SchedulePhase {
                    items: p.items.clone(),
                    currency: p.currency.clone(),
                    start_date: start,
                    end_date: end,
                    metadata: p.metadata.clone(),
                    auto_tax: p.auto_tax,
                });
                cursor = end;
            }

            let current = phases
                .iter()
                .position(|p| p.start_date <= now && p.end_date > now);
            schedule.current_phase = current.map(|idx| PhaseWindow {
                start_date: phases[idx].start_date,
                end_date: phases[idx].end_date,
            });
            if let Some(idx) = current.filter(|idx| *idx > 0) {
                // Immediate switch: the subscription now bills the new phase.
                let prices = self.inner.prices.read().unwrap();
                sub.items = phases[idx]
                    .items
                    .iter()
                    .map(|item| {
                        let (product, interval) = prices
                            .get(&item.price_provider_id)
                            .cloned()
                            .unwrap_or_else(|| (String::new(), "month".to_string()));
                        ProviderSubscriptionItem {
                            id: format!("si_{}_{}", schedule_id, item.price_provider_id),
                            price_provider_id: item.price_provider_id.clone(),
                            product_provider_id: product,
                            interval,
                            quantity: item.quantity.unwrap_or(0),
                            metadata: item.metadata.clone(),
                        }
                    })
                    .collect();
                sub.current_period_start = phases[idx].start_date;
                sub.current_period_end = phases[idx].end_date;
            }
            schedule.phases = phases;
            schedule.end_behavior = params.end_behavior;
            *self.inner.last_schedule_update.write().unwrap() = Some(params);
            Ok(schedule.clone())
        }
    }

    #[async_trait]
    impl ProviderCustomerClient for MockProviderClient {
        async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
            self.check_fail("get customer")?;
            self.inner
                .customers
                .read()
                .unwrap()
                .get(customer_id)
                .cloned()
                .ok_or_else(|| BillingError::provider("get customer", "no such customer"))
        }
    }

    #[async_trait]
    impl ProviderInvoiceClient for MockProviderClient {
        async fn list_invoices(&self, customer_provider_id: &str) -> Result<Vec<ProviderInvoice>> {
            self.check_fail("list invoices")?;
            let mut invoices: Vec<_> = self
                .inner
                .invoices
                .read()
                .unwrap()
                .values()
                .filter(|i| i.customer_provider_id == customer_provider_id)
                .cloned()
                .collect();
            invoices.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
            Ok(invoices)
        }

        async fn get_invoice(&self, invoice_id: &str) -> Result<ProviderInvoice> {
            self.check_fail("get invoice")?;
            self.invoice(invoice_id)
                .ok_or_else(|| BillingError::provider("get invoice", "no such invoice"))
        }

        async fn get_upcoming_invoice(&self, customer_provider_id: &str) -> Result<Option<ProviderInvoice>> {
            self.check_fail("get upcoming invoice")?;
            Ok(self
                .inner
                .upcoming
                .read()
                .unwrap()
                .get(customer_provider_id)
                .cloned())
        }

        async fn create_invoice(&self, params: CreateInvoiceParams) -> Result<ProviderInvoice> {
            self.check_fail("create invoice")?;
            let now = current_timestamp();
            let lines: Vec<ProviderInvoiceLine> = params
                .items
                .iter()
                .map(|item| ProviderInvoiceLine {
                    id: self.next_id("il"),
                    description: item.description.clone(),
                    quantity: item.quantity,
                    unit_amount: item.unit_amount,
                    metadata: item.metadata.clone(),
                    period_start: item.period.map(|(start, _)| start),
                    period_end: item.period.map(|(_, end)| end),
                })
                .collect();
            let invoice = ProviderInvoice {
                id: self.next_id("in"),
                customer_provider_id: params.customer_provider_id.clone(),
                status: "open".to_string(),
                currency: params.currency.clone(),
                total: lines.iter().map(|l| l.unit_amount * l.quantity).sum(),
                hosted_url: String::new(),
                metadata: params.metadata.clone(),
                lines,
                effective_at: Some(now),
                due_date: params.days_until_due.map(|d| now + d.max(0) as u64 * 86_400),
                next_payment_attempt: None,
                created: now,
                period_start: now,
                period_end: now,
            };
            self.insert_invoice(invoice.clone());
            self.inner.created_invoices.write().unwrap().push(params);
            Ok(invoice)
        }
    }
}
