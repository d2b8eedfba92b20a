//! Wiring of the billing engines.

use std::collections::HashMap;
use std::sync::Arc;

use super::audit::{BillingAuditLogger, NoOpAuditLogger};
use super::background::BackgroundSync;
use super::checkout::{Checkout, CheckoutEngine};
use super::client::PaymentProviderClient;
use super::customer::CustomerSyncer;
use super::directory::Directory;
use super::entitlements::EntitlementChecker;
use super::error::{BillingError, Result};
use super::invoice::InvoiceEngine;
use super::ledger::{Credit, Ledger};
use super::storage::{BillingStore, SubscriptionFilter};
use super::subscription::{Subscription, SubscriptionEngine};
use super::usage::UsageReporter;
use super::webhook::WebhookDispatcher;
use crate::config::BillingConfig;

/// Source recorded on credits granted when an account is onboarded.
pub const AWARDED_SOURCE: &str = "system.awarded";

/// Deterministic transaction id for a customer's onboarding credits.
#[must_use]
pub fn onboard_credit_id(customer_id: &str) -> String {
    let key = format!("account-onboard:{}", customer_id);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Every billing engine, built over one store, directory and provider client.
///
/// ```rust,ignore
/// let billing = BillingService::new(store, directory, client, config);
/// billing.background.init();
///
/// let checkout = billing.checkouts.create(Checkout::for_plan("cust_1", "pro")).await?;
/// billing.usage.report(vec![Usage::credit("u1", "cust_1", 5)]).await?;
/// ```
#[derive(Clone)]
pub struct BillingService<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    pub ledger: Ledger<S>,
    pub usage: UsageReporter<S>,
    pub checkouts: CheckoutEngine<S, D, C>,
    pub subscriptions: SubscriptionEngine<S, D, C>,
    pub invoices: InvoiceEngine<S, D, C>,
    pub entitlements: EntitlementChecker<S, D, C>,
    pub customers: CustomerSyncer<S, C>,
    pub webhooks: WebhookDispatcher,
    pub background: BackgroundSync<S, D, C>,
    store: S,
    directory: D,
    config: BillingConfig,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> BillingService<S, D, C> {
    #[must_use]
    pub fn new(store: S, directory: D, client: C, config: BillingConfig) -> Self {
        Self::with_audit_logger(store, directory, client, config, Arc::new(NoOpAuditLogger))
    }

    #[must_use]
    pub fn with_audit_logger(
        store: S,
        directory: D,
        client: C,
        config: BillingConfig,
        audit: Arc<dyn BillingAuditLogger>,
    ) -> Self {
        let ledger = Ledger::new(store.clone()).with_audit_logger(Arc::clone(&audit));
        let subscriptions = SubscriptionEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            config.clone(),
        )
        .with_audit_logger(Arc::clone(&audit));
        let checkouts = CheckoutEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            subscriptions.clone(),
            config.clone(),
        )
        .with_audit_logger(Arc::clone(&audit));
        let invoices = InvoiceEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            config.clone(),
        )
        .with_audit_logger(Arc::clone(&audit));
        let customers = CustomerSyncer::new(store.clone(), client);
        let webhooks = WebhookDispatcher::new(
            &config.webhook,
            checkouts.clone(),
            subscriptions.clone(),
            invoices.clone(),
            customers.clone(),
        )
        .with_audit_logger(audit);
        let background = BackgroundSync::new(
            store.clone(),
            checkouts.clone(),
            subscriptions.clone(),
            invoices.clone(),
            &config,
        );

        Self {
            usage: UsageReporter::new(ledger.clone()),
            entitlements: EntitlementChecker::new(
                store.clone(),
                directory.clone(),
                subscriptions.clone(),
            ),
            ledger,
            checkouts,
            subscriptions,
            invoices,
            customers,
            webhooks,
            background,
            store,
            directory,
            config,
        }
    }

    /// Put a customer on the configured free plan and grant onboarding credits.
    ///
    /// The plan step is skipped when the customer already has an active
    /// subscription. Credits are keyed on the customer, so repeated calls
    /// grant them once. Returns the subscription this call created, if any.
    pub async fn ensure_default_plan(&self, customer_id: &str) -> Result<Option<Subscription>> {
        let account = &self.config.account;
        let mut created = None;

        if !account.default_plan.is_empty() {
            let subs = self
                .store
                .list_subscriptions(SubscriptionFilter {
                    customer_id: Some(customer_id.to_string()),
                    ..SubscriptionFilter::default()
                })
                .await?;
            if !subs.iter().any(Subscription::is_active) {
                let plan = self.directory.get_plan(&account.default_plan).await?;
                let priced = plan
                    .products
                    .iter()
                    .flat_map(|p| p.prices.iter())
                    .any(|price| price.amount > 0);
                if priced {
                    return Err(BillingError::invalid_detail(format!(
                        "default plan {} is not free",
                        plan.id
                    )));
                }

                match self
                    .checkouts
                    .apply(Checkout::for_plan(customer_id, plan.id.clone()))
                    .await
                {
                    Ok(sub) => {
                        tracing::info!(
                            target: "tideway::billing::service",
                            customer_id = %customer_id,
                            plan_id = %plan.id,
                            subscription_id = %sub.id,
                            "Default plan applied"
                        );
                        created = Some(sub);
                    }
                    Err(BillingError::ActiveConflict { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if account.onboard_credits > 0 {
            let mut credit = Credit::new(
                onboard_credit_id(customer_id),
                customer_id,
                account.onboard_credits,
            )
            .with_source(AWARDED_SOURCE)
            .with_description(format!(
                "Awarded {} credits for onboarding",
                account.onboard_credits
            ));
            credit.metadata = HashMap::from([("auto_created".to_string(), "true".to_string())]);
            match self.ledger.add(credit).await {
                Ok(()) | Err(BillingError::AlreadyApplied { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }
}
