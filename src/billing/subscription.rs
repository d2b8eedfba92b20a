//! Subscription lifecycle and reconciliation with the payment provider.
//!
//! The provider owns the subscription; the local record mirrors it. Every
//! write (cancel, plan change) goes through a subscription schedule at the
//! provider and is reflected locally right away. [`SubscriptionEngine::sync_with_provider`]
//! is the single reconciliation path used by reads, webhooks and the
//! background loop.
//!
//! Plan changes use a two-phase schedule: the current phase keeps billing
//! the current plan until it ends (or ends now for an immediate change) and
//! a one-iteration phase bills the target plan afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::client::{
    CancelSubscriptionParams, PaymentProviderClient, PhaseEnd, PhaseItem, ProviderSchedule,
    ProviderSubscription, ScheduleEndBehavior, SchedulePhase, SchedulePhaseParams,
    UpdateScheduleParams, UpdateSubscriptionItemsParams,
};
use super::customer::Customer;
use super::debounce::SyncDebouncer;
use super::directory::Directory;
use super::error::{BillingError, Result};
use super::ledger::{Credit, Ledger};
use super::plans::{Plan, PlanFilter, ProductBehavior};
use super::seats;
use super::storage::{BillingStore, SubscriptionFilter};
use crate::config::BillingConfig;

/// Metadata key naming the user who started the subscription.
pub const INITIATOR_ID_METADATA_KEY: &str = "initiated_by";

/// Source recorded on credits granted when a plan starts.
pub const ONBOARD_SOURCE: &str = "system.starter";

/// Provider subscription status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionState {
    Active,
    Trialing,
    PastDue,
    Canceled,
    /// Created but the first payment has not succeeded yet.
    #[default]
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Ended,
    /// A status this crate does not know about, kept verbatim.
    Unrecognized(String),
}

impl SubscriptionState {
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            "ended" => Self::Ended,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::Ended => "ended",
            Self::Unrecognized(s) => s,
        }
    }

    /// Active or trialing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// The subscription is over and no longer blocks a new one.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Canceled | Self::Ended)
    }

    /// The provider will not accept a schedule for this status.
    fn rejects_schedule(&self) -> bool {
        matches!(self, Self::Canceled | Self::Incomplete | Self::IncompleteExpired)
    }
}

impl From<String> for SubscriptionState {
    fn from(value: String) -> Self {
        Self::from_provider(&value)
    }
}

impl From<SubscriptionState> for String {
    fn from(value: SubscriptionState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A period billed on one plan.
///
/// On a subscription, `phase` is the upcoming change: the plan that takes
/// over and when. History entries record plans the subscription was on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub plan_id: String,
    pub effective_at: u64,
    pub ends_at: u64,
}

/// A customer's subscription to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Subscription id at the payment provider.
    pub provider_id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub state: SubscriptionState,
    pub phase: Phase,
    /// Plans this subscription was on before, oldest first.
    pub plan_history: Vec<Phase>,
    pub canceled_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub trial_ends_at: Option<u64>,
    pub current_period_start: u64,
    pub current_period_end: u64,
    pub billing_cycle_anchor: u64,
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Subscription {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            plan_id: plan_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: SubscriptionState) -> Self {
        self.state = state;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether this subscription was ever on `plan_id`.
    #[must_use]
    pub fn references_plan(&self, plan_id: &str) -> bool {
        self.plan_id == plan_id || self.plan_history.iter().any(|p| p.plan_id == plan_id)
    }

    /// Copy status and timestamps from the provider. Returns whether anything changed.
    pub fn mirror_provider(&mut self, remote: &ProviderSubscription) -> bool {
        let before = self.clone();
        self.state = SubscriptionState::from_provider(&remote.status);
        if let Some(at) = remote.canceled_at.filter(|t| *t > 0) {
            self.canceled_at = Some(at);
        }
        if let Some(at) = remote.ended_at.filter(|t| *t > 0) {
            self.ended_at = Some(at);
        }
        if let Some(at) = remote.trial_end.filter(|t| *t > 0) {
            self.trial_ends_at = Some(at);
        }
        if remote.current_period_start > 0 {
            self.current_period_start = remote.current_period_start;
        }
        if remote.current_period_end > 0 {
            self.current_period_end = remote.current_period_end;
        }
        if remote.billing_cycle_anchor > 0 {
            self.billing_cycle_anchor = remote.billing_cycle_anchor;
        }
        *self != before
    }

    /// Move to `plan_id`, closing the previous plan in the history.
    fn switch_plan(&mut self, plan_id: String, now: u64) {
        if !self.plan_id.is_empty() {
            let effective_at = self
                .plan_history
                .last()
                .map(|p| p.ends_at)
                .unwrap_or(self.created_at);
            self.plan_history.push(Phase {
                plan_id: std::mem::take(&mut self.plan_id),
                effective_at,
                ends_at: now,
            });
        }
        self.plan_id = plan_id;
    }
}

/// Request to move a subscription to another plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub plan_id: String,
    /// Switch now instead of at the end of the current period.
    pub immediate: bool,
    /// Drop a scheduled change instead of making one.
    pub cancel_upcoming: bool,
}

/// Deterministic transaction id for the once-per-customer plan starter credits.
#[must_use]
pub fn onboard_transaction_id(plan_id: &str, customer_id: &str) -> String {
    let key = format!("{}:{}", plan_id, customer_id);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Subscription operations and provider reconciliation.
#[derive(Clone)]
pub struct SubscriptionEngine<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    store: S,
    directory: D,
    client: C,
    ledger: Ledger<S>,
    config: BillingConfig,
    audit: Arc<dyn BillingAuditLogger>,
    debouncer: SyncDebouncer,
    sync_lock: Arc<Mutex<()>>,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> SubscriptionEngine<S, D, C> {
    #[must_use]
    pub fn new(store: S, directory: D, client: C, ledger: Ledger<S>, config: BillingConfig) -> Self {
        let debouncer = SyncDebouncer::new(config.subscription_sync_delay());
        Self {
            store,
            directory,
            client,
            ledger,
            config,
            audit: Arc::new(NoOpAuditLogger),
            debouncer,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Set the audit logger for lifecycle events.
    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Persist a subscription as given, generating an id when empty.
    pub async fn create(&self, mut subscription: Subscription) -> Result<Subscription> {
        if subscription.id.is_empty() {
            subscription.id = uuid::Uuid::new_v4().to_string();
        }
        let now = super::current_timestamp();
        if subscription.created_at == 0 {
            subscription.created_at = now;
        }
        subscription.updated_at = now;

        let created = self.store.create_subscription(subscription).await?;
        tracing::info!(
            target: "tideway::billing::subscription",
            subscription_id = %created.id,
            customer_id = %created.customer_id,
            plan_id = %created.plan_id,
            "Subscription created"
        );
        self.audit
            .log(BillingAuditEvent::SubscriptionCreated {
                customer_id: created.customer_id.clone(),
                subscription_id: created.id.clone(),
                plan_id: created.plan_id.clone(),
            })
            .await;
        Ok(created)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Subscription> {
        self.store.get_subscription(id).await
    }

    pub async fn get_by_provider_id(&self, provider_id: &str) -> Result<Subscription> {
        self.store.get_subscription_by_provider_id(provider_id).await
    }

    /// List subscriptions from storage.
    ///
    /// When the filter names a customer, a debounced background sync for
    /// that customer is requested; the result is served from storage either way.
    pub async fn list(&self, filter: SubscriptionFilter) -> Result<Vec<Subscription>> {
        if let Some(customer_id) = &filter.customer_id {
            let customer = self.store.get_customer(customer_id).await?;
            let engine = self.clone();
            self.debouncer.call(move || async move {
                if let Err(e) = engine.sync_with_provider(&customer).await {
                    tracing::error!(
                        target: "tideway::billing::subscription",
                        customer_id = %customer.id,
                        error = %e,
                        "Background subscription sync failed"
                    );
                }
            });
        }
        self.store.list_subscriptions(filter).await
    }

    /// Cancel a subscription now or at the end of the current period.
    ///
    /// Canceling an already canceled subscription returns it unchanged.
    pub async fn cancel(&self, id: &str, immediate: bool) -> Result<Subscription> {
        let mut sub = self.store.get_subscription(id).await?;
        if sub.canceled_at.is_some() {
            return Ok(sub);
        }

        let (_, schedule) = self.provider_state(&sub).await?;
        match schedule.filter(|_| !immediate) {
            None => {
                let remote = self
                    .client
                    .cancel_subscription(
                        &sub.provider_id,
                        CancelSubscriptionParams {
                            invoice_now: true,
                            prorate: true,
                        },
                    )
                    .await?;
                sub.state = SubscriptionState::from_provider(&remote.status);
                if let Some(at) = remote.canceled_at.filter(|t| *t > 0) {
                    sub.canceled_at = Some(at);
                }
            }
            Some(schedule) => {
                let phase = schedule
                    .active_phase()
                    .or_else(|| schedule.next_phase())
                    .ok_or_else(|| {
                        BillingError::invalid_detail(format!(
                            "subscription schedule {} has no phase to end",
                            schedule.id
                        ))
                    })?;
                let updated = self
                    .client
                    .update_schedule(
                        &schedule.id,
                        UpdateScheduleParams {
                            phases: vec![phase.to_params()],
                            end_behavior: ScheduleEndBehavior::Cancel,
                            proration_behavior: self.config.plan_change.proration_behavior.clone(),
                            collection_method: self.config.plan_change.collection_method.clone(),
                        },
                    )
                    .await?;
                sub.phase.plan_id.clear();
                if let Some(first) = updated.phases.first() {
                    sub.phase.effective_at = first.end_date;
                }
            }
        }
        // Without a schedule the cancel is immediate regardless of the flag.
        let canceled_now = sub.canceled_at.is_some();
        sub.updated_at = super::current_timestamp();
        let sub = self.store.update_subscription(sub).await?;

        tracing::info!(
            target: "tideway::billing::subscription",
            subscription_id = %sub.id,
            immediate = canceled_now,
            "Subscription canceled"
        );
        self.audit
            .log(BillingAuditEvent::SubscriptionCanceled {
                customer_id: sub.customer_id.clone(),
                subscription_id: sub.id.clone(),
                immediate: canceled_now,
            })
            .await;
        Ok(sub)
    }

    /// Schedule (or apply immediately) a move to another plan.
    ///
    /// Returns the upcoming phase as stored on the subscription.
    pub async fn change_plan(&self, id: &str, request: ChangeRequest) -> Result<Phase> {
        let mut sub = self.store.get_subscription(id).await?;
        if !sub.is_active() {
            return Err(BillingError::SubscriptionInactive { id: sub.id });
        }
        if request.cancel_upcoming {
            return self.cancel_upcoming_phase(sub).await;
        }

        let target = self.directory.get_plan(&request.plan_id).await?;
        if sub.plan_id == target.id {
            return Err(BillingError::AlreadyOnSamePlan { plan_id: target.id });
        }

        let (remote, schedule) = self.provider_state(&sub).await?;
        let schedule = schedule.ok_or_else(|| BillingError::SubscriptionInactive { id: sub.id.clone() })?;
        let current_plan = self.find_plan_by_items(&remote).await?;
        if current_plan.id == target.id {
            return Ok(sub.phase);
        }

        let customer = self.store.get_customer(&sub.customer_id).await?;
        let members = self.directory.member_count(&customer.org_id).await?;
        let next_items = self.phase_items_for_plan(&target, members)?;

        let now = super::current_timestamp();
        let mut phases = Vec::with_capacity(2);
        if let (Some(window), Some(active)) = (schedule.current_phase, schedule.active_phase()) {
            // A phase that already ended is being rolled over by the provider.
            if window.end_date >= now {
                phases.push(SchedulePhaseParams {
                    items: active.items.clone(),
                    currency: customer.currency.clone(),
                    start_date: Some(window.start_date),
                    end: if request.immediate {
                        PhaseEnd::Now
                    } else {
                        PhaseEnd::At(window.end_date)
                    },
                    metadata: self.phase_metadata(&current_plan.id),
                    auto_tax: remote.auto_tax,
                });
            }
        }
        if !next_items.is_empty() {
            phases.push(SchedulePhaseParams {
                items: next_items,
                currency: customer.currency.clone(),
                start_date: None,
                end: PhaseEnd::Iterations(1),
                metadata: self.phase_metadata(&target.id),
                auto_tax: self.config.auto_tax,
            });
        }

        let proration_behavior = if request.immediate {
            self.config.plan_change.immediate_proration_behavior.clone()
        } else {
            self.config.plan_change.proration_behavior.clone()
        };
        let updated = self
            .client
            .update_schedule(
                &schedule.id,
                UpdateScheduleParams {
                    phases,
                    end_behavior: ScheduleEndBehavior::Release,
                    proration_behavior,
                    collection_method: self.config.plan_change.collection_method.clone(),
                },
            )
            .await?;

        let next_plan_id = match self.plans_from_schedule(&updated).await? {
            Some((_, next)) => next,
            None => String::new(),
        };
        if let Some(window) = updated.current_phase.filter(|w| w.end_date > 0) {
            sub.phase.effective_at = window.end_date;
        }
        sub.phase.plan_id = next_plan_id;
        sub.updated_at = now;
        let sub = self.store.update_subscription(sub).await?;

        tracing::info!(
            target: "tideway::billing::subscription",
            subscription_id = %sub.id,
            from_plan_id = %current_plan.id,
            to_plan_id = %target.id,
            immediate = request.immediate,
            "Plan change scheduled"
        );
        self.audit
            .log(BillingAuditEvent::PlanChanged {
                customer_id: sub.customer_id.clone(),
                subscription_id: sub.id.clone(),
                from_plan_id: current_plan.id,
                to_plan_id: target.id,
                immediate: request.immediate,
            })
            .await;
        Ok(sub.phase)
    }

    /// Reconcile every subscription of the customer with the provider.
    ///
    /// Serialized per engine. Failures of individual subscriptions do not
    /// stop the others; they come back joined.
    pub async fn sync_with_provider(&self, customer: &Customer) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        let subs = self
            .store
            .list_subscriptions(SubscriptionFilter {
                customer_id: Some(customer.id.clone()),
                ..SubscriptionFilter::default()
            })
            .await?;

        let mut errors = Vec::new();
        for sub in subs {
            let id = sub.id.clone();
            if let Err(e) = self.sync_subscription(customer, sub).await {
                tracing::warn!(
                    target: "tideway::billing::subscription",
                    subscription_id = %id,
                    error = %e,
                    "Subscription sync failed"
                );
                errors.push((id, e));
            }
        }
        BillingError::join(errors)
    }

    /// Sync the customer owning a provider subscription (webhook path).
    pub async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        let sub = self.store.get_subscription_by_provider_id(provider_id).await?;
        let customer = self.store.get_customer(&sub.customer_id).await?;
        self.sync_with_provider(&customer).await
    }

    /// Whether the customer was ever subscribed to `plan_id`.
    pub async fn has_user_subscribed_before(&self, customer_id: &str, plan_id: &str) -> Result<bool> {
        let subs = self
            .list(SubscriptionFilter {
                customer_id: Some(customer_id.to_string()),
                ..SubscriptionFilter::default()
            })
            .await?;
        Ok(subs.iter().any(|s| s.references_plan(plan_id)))
    }

    /// Cancel the customer's live subscriptions immediately and remove every record.
    pub async fn delete_by_customer(&self, customer: &Customer) -> Result<()> {
        self.sync_with_provider(customer).await?;
        let subs = self
            .store
            .list_subscriptions(SubscriptionFilter {
                customer_id: Some(customer.id.clone()),
                ..SubscriptionFilter::default()
            })
            .await?;
        for sub in subs {
            if sub.is_active() {
                self.cancel(&sub.id, true).await?;
            }
            self.store.delete_subscription(&sub.id).await?;
        }
        tracing::info!(
            target: "tideway::billing::subscription",
            customer_id = %customer.id,
            "Subscriptions deleted for customer"
        );
        Ok(())
    }

    async fn sync_subscription(&self, customer: &Customer, mut sub: Subscription) -> Result<()> {
        let (remote, schedule) = self.provider_state(&sub).await?;
        let now = super::current_timestamp();
        let mut changed = sub.mirror_provider(&remote);

        let plans = match &schedule {
            Some(schedule) => self.plans_from_schedule(schedule).await?,
            None => None,
        };
        let (current_plan_id, next_plan_id) = match plans {
            Some(plans) => plans,
            None => (self.find_plan_by_items(&remote).await?.id, String::new()),
        };

        if !current_plan_id.is_empty() && sub.plan_id != current_plan_id {
            sub.switch_plan(current_plan_id, now);
            changed = true;
        }
        if sub.phase.plan_id != next_plan_id {
            sub.phase.plan_id = next_plan_id;
            changed = true;
        }
        if let Some(schedule) = &schedule {
            let effective_at = schedule.current_phase.map(|w| w.end_date).unwrap_or(0);
            if sub.phase.effective_at != effective_at {
                sub.phase.effective_at = effective_at;
                changed = true;
            }
        }

        if changed {
            sub.updated_at = now;
            sub = self.store.update_subscription(sub).await?;
            tracing::debug!(
                target: "tideway::billing::subscription",
                subscription_id = %sub.id,
                state = %sub.state,
                plan_id = %sub.plan_id,
                "Subscription updated from provider"
            );
        }

        if sub.is_active() {
            let plan = self.directory.get_plan(&sub.plan_id).await?;
            self.sync_seat_quantity(customer, &sub, &plan, &remote, schedule.as_ref())
                .await?;
            self.ensure_credits_for_plan(&sub, &plan).await?;
        }
        Ok(())
    }

    /// Fetch the provider subscription and its schedule, creating the
    /// schedule when the subscription can carry one.
    async fn provider_state(
        &self,
        sub: &Subscription,
    ) -> Result<(ProviderSubscription, Option<ProviderSchedule>)> {
        let remote = self.client.get_subscription(&sub.provider_id).await?;
        let existing = match remote.schedule_id.as_deref() {
            Some(schedule_id) if !schedule_id.is_empty() => {
                Some(self.client.get_schedule(schedule_id).await?)
            }
            _ => None,
        };

        if SubscriptionState::from_provider(&remote.status).rejects_schedule() {
            return Ok((remote, None));
        }
        let schedule = match existing {
            Some(schedule) => schedule,
            None => self.client.create_schedule_from_subscription(&remote.id).await?,
        };
        Ok((remote, Some(schedule)))
    }

    /// Push the member count to seat-priced items of the subscription and,
    /// when a change is scheduled, of both schedule phases.
    async fn sync_seat_quantity(
        &self,
        customer: &Customer,
        sub: &Subscription,
        plan: &Plan,
        remote: &ProviderSubscription,
        schedule: Option<&ProviderSchedule>,
    ) -> Result<()> {
        let behavior = self.config.seat_change_behavior;
        let members = self.directory.member_count(&customer.org_id).await?;

        if let Some(seat_product) = plan.seat_product() {
            let updates = seats::seat_item_updates(seat_product, &remote.items, members, behavior);
            if !updates.is_empty() {
                self.client
                    .update_subscription_items(
                        &remote.id,
                        UpdateSubscriptionItemsParams {
                            items: updates,
                            proration_behavior: self.config.plan_change.proration_behavior.clone(),
                            pending_invoice_item_interval: seats::pending_invoice_item_interval(plan),
                        },
                    )
                    .await?;
                tracing::info!(
                    target: "tideway::billing::subscription",
                    subscription_id = %sub.id,
                    quantity = members,
                    "Seat quantity synced"
                );
                self.audit
                    .log(BillingAuditEvent::SeatQuantitySynced {
                        customer_id: sub.customer_id.clone(),
                        subscription_id: sub.id.clone(),
                        quantity: members,
                    })
                    .await;
            }
        }

        let Some(schedule) = schedule else {
            return Ok(());
        };
        let (Some(current), Some(next)) = (schedule.active_phase(), schedule.next_phase()) else {
            return Ok(());
        };
        let Some((_, next_plan_id)) = self.plans_from_schedule(schedule).await? else {
            return Ok(());
        };
        let next_plan = self.directory.get_plan(&next_plan_id).await?;

        let mut current = current.to_params();
        let mut next = next.to_params();
        let mut changed = false;
        if let Some(seat_product) = plan.seat_product() {
            changed |= seats::adjust_phase_items(seat_product, &mut current.items, members, behavior);
        }
        if let Some(seat_product) = next_plan.seat_product() {
            changed |= seats::adjust_phase_items(seat_product, &mut next.items, members, behavior);
        }
        if !changed {
            return Ok(());
        }

        let mut phases = Vec::with_capacity(2);
        if matches!(current.end, PhaseEnd::At(end) if end > super::current_timestamp()) {
            phases.push(current);
        }
        phases.push(next);
        self.client
            .update_schedule(
                &schedule.id,
                UpdateScheduleParams {
                    phases,
                    end_behavior: schedule.end_behavior,
                    proration_behavior: self.config.plan_change.proration_behavior.clone(),
                    collection_method: self.config.plan_change.collection_method.clone(),
                },
            )
            .await?;
        Ok(())
    }

    /// Grant the plan's starter credits once per (plan, customer).
    async fn ensure_credits_for_plan(&self, sub: &Subscription, plan: &Plan) -> Result<()> {
        if plan.on_start_credits <= 0 {
            return Ok(());
        }
        let tx_id = onboard_transaction_id(&plan.id, &sub.customer_id);
        // Checkout fulfilment and direct apply key their grant by checkout
        // or subscription id instead.
        let granted_ids = [
            Some(tx_id.as_str()),
            sub.metadata.get("checkout_id").map(String::as_str),
            Some(sub.id.as_str()),
        ];
        for id in granted_ids.into_iter().flatten() {
            match self.ledger.get_by_id(id).await {
                Ok(tx) if tx.account_id == sub.customer_id => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let mut credit = Credit::new(tx_id, sub.customer_id.clone(), plan.on_start_credits)
            .with_source(ONBOARD_SOURCE)
            .with_description(format!(
                "addition of {} credits for {}",
                plan.on_start_credits,
                plan.display_title()
            ));
        credit.metadata = plan.metadata.clone();
        credit.user_id = sub
            .metadata
            .get(INITIATOR_ID_METADATA_KEY)
            .cloned()
            .unwrap_or_default();
        match self.ledger.add(credit).await {
            Ok(()) | Err(BillingError::AlreadyApplied { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn cancel_upcoming_phase(&self, mut sub: Subscription) -> Result<Phase> {
        let (_, schedule) = self.provider_state(&sub).await?;
        let schedule = schedule.ok_or_else(|| BillingError::SubscriptionInactive { id: sub.id.clone() })?;
        let (Some(window), Some(first)) = (schedule.current_phase, schedule.phases.first()) else {
            return Err(BillingError::invalid_detail(format!(
                "subscription schedule {} has no active phase",
                schedule.id
            )));
        };

        self.client
            .update_schedule(
                &schedule.id,
                UpdateScheduleParams {
                    phases: vec![SchedulePhaseParams {
                        items: first.items.clone(),
                        currency: first.currency.clone(),
                        start_date: Some(window.start_date),
                        end: PhaseEnd::At(window.end_date),
                        metadata: self.phase_metadata(&sub.plan_id),
                        auto_tax: first.auto_tax,
                    }],
                    end_behavior: ScheduleEndBehavior::Release,
                    proration_behavior: self.config.plan_change.proration_behavior.clone(),
                    collection_method: self.config.plan_change.collection_method.clone(),
                },
            )
            .await?;

        sub.phase = Phase::default();
        sub.updated_at = super::current_timestamp();
        let sub = self.store.update_subscription(sub).await?;
        tracing::info!(
            target: "tideway::billing::subscription",
            subscription_id = %sub.id,
            "Upcoming plan change canceled"
        );
        Ok(sub.phase)
    }

    /// Provider items for the target plan of a change.
    fn phase_items_for_plan(&self, plan: &Plan, members: i64) -> Result<Vec<PhaseItem>> {
        let mut items = Vec::new();
        for product in &plan.products {
            if product.behavior == ProductBehavior::Credits {
                continue;
            }
            product.check_seat_limit(members)?;
            for price in plan.interval_prices(product) {
                let quantity = if product.is_per_seat() { members } else { 1 };
                items.push(PhaseItem {
                    price_provider_id: price.provider_id.clone(),
                    quantity: Some(quantity),
                    metadata: HashMap::from([
                        ("price_id".to_string(), price.id.clone()),
                        ("managed_by".to_string(), self.config.managed_by.clone()),
                    ]),
                });
            }
        }
        Ok(items)
    }

    fn phase_metadata(&self, plan_id: &str) -> HashMap<String, String> {
        HashMap::from([
            ("plan_id".to_string(), plan_id.to_string()),
            ("managed_by".to_string(), self.config.managed_by.clone()),
        ])
    }

    /// Current and next plan ids of a schedule; `None` without a current phase.
    async fn plans_from_schedule(&self, schedule: &ProviderSchedule) -> Result<Option<(String, String)>> {
        let Some(window) = schedule.current_phase else {
            return Ok(None);
        };
        let mut current = String::new();
        let mut next = String::new();
        for phase in &schedule.phases {
            if phase.start_date == window.start_date {
                current = self.plan_id_of_phase(phase).await?;
            } else if phase.start_date >= window.end_date {
                next = self.plan_id_of_phase(phase).await?;
            }
        }
        Ok(Some((current, next)))
    }

    async fn plan_id_of_phase(&self, phase: &SchedulePhase) -> Result<String> {
        if let Some(plan_id) = phase.metadata.get("plan_id") {
            return Ok(plan_id.clone());
        }
        let plans = self.directory.list_plans(PlanFilter::default()).await?;
        let matched: Vec<Plan> = plans
            .into_iter()
            .filter(|plan| plan_bills_prices(plan, &phase.items))
            .collect();
        let plan = single_plan(matched, || {
            format!(
                "phase items {:?}",
                phase.items.iter().map(|i| i.price_provider_id.as_str()).collect::<Vec<_>>()
            )
        })?;
        Ok(plan.id)
    }

    /// Resolve the plan a provider subscription bills from its items' products.
    async fn find_plan_by_items(&self, remote: &ProviderSubscription) -> Result<Plan> {
        let mut plan_ids: Option<Vec<String>> = None;
        let mut interval = None;
        for item in &remote.items {
            let product = self
                .directory
                .get_product_by_provider_id(&item.product_provider_id)
                .await?;
            plan_ids = Some(match plan_ids {
                None => {
                    interval = Some(item.interval.clone());
                    product.plan_ids
                }
                Some(ids) => ids.into_iter().filter(|id| product.plan_ids.contains(id)).collect(),
            });
        }
        let plan_ids = plan_ids.unwrap_or_default();
        if plan_ids.is_empty() {
            return Err(BillingError::PlanNotFound {
                id: format!("provider subscription {}", remote.id),
            });
        }
        let plans = self
            .directory
            .list_plans(PlanFilter {
                ids: plan_ids,
                interval,
            })
            .await?;
        single_plan(plans, || format!("provider subscription {}", remote.id))
    }
}

fn plan_bills_prices(plan: &Plan, items: &[PhaseItem]) -> bool {
    if items.is_empty() {
        return false;
    }
    let billed = |price_id: &str| {
        plan.products
            .iter()
            .any(|product| plan.interval_prices(product).any(|p| p.provider_id == price_id))
    };
    let covers_products = plan
        .products
        .iter()
        .filter(|p| p.behavior != ProductBehavior::Credits)
        .all(|product| {
            plan.interval_prices(product)
                .any(|price| items.iter().any(|i| i.price_provider_id == price.provider_id))
        });
    covers_products && items.iter().all(|i| billed(&i.price_provider_id))
}

fn single_plan(mut plans: Vec<Plan>, describe: impl FnOnce() -> String) -> Result<Plan> {
    match plans.len() {
        0 => Err(BillingError::PlanNotFound { id: describe() }),
        1 => Ok(plans.remove(0)),
        n => Err(BillingError::internal(format!(
            "{} plans match {}",
            n,
            describe()
        ))),
    }
}
