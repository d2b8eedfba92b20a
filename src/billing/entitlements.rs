//! Entitlements and feature gating.
//!
//! A customer is entitled to a feature or product when one of its active
//! subscriptions is on a plan the product is sold under.

use super::client::PaymentProviderClient;
use super::directory::Directory;
use super::error::{BillingError, Result};
use super::plans::Product;
use super::storage::{BillingStore, SubscriptionFilter};
use super::subscription::SubscriptionEngine;

/// Answers "may this customer use X" from subscriptions and the catalog.
#[derive(Clone)]
pub struct EntitlementChecker<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    store: S,
    directory: D,
    subscriptions: SubscriptionEngine<S, D, C>,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> EntitlementChecker<S, D, C> {
    #[must_use]
    pub fn new(store: S, directory: D, subscriptions: SubscriptionEngine<S, D, C>) -> Self {
        Self {
            store,
            directory,
            subscriptions,
        }
    }

    /// Whether the customer has access to a feature or product.
    ///
    /// `feature_or_product_id` is looked up as a feature first and as a
    /// product id when no such feature exists.
    pub async fn check(&self, customer_id: &str, feature_or_product_id: &str) -> Result<bool> {
        let subs = self
            .subscriptions
            .list(SubscriptionFilter {
                customer_id: Some(customer_id.to_string()),
                ..SubscriptionFilter::default()
            })
            .await?;
        let products = self.resolve_products(feature_or_product_id).await?;

        let entitled = subs
            .iter()
            .filter(|sub| sub.is_active())
            .any(|sub| products.iter().any(|p| p.allows_plan(&sub.plan_id)));
        tracing::debug!(
            target: "tideway::billing::entitlements",
            customer_id,
            id = feature_or_product_id,
            entitled,
            "Entitlement checked"
        );
        Ok(entitled)
    }

    /// Fails with `PerSeatLimitReached` when the organization has outgrown a
    /// seat limit on any active plan.
    pub async fn check_plan_eligibility(&self, customer_id: &str) -> Result<()> {
        let customer = self.store.get_customer(customer_id).await?;
        let subs = self
            .subscriptions
            .list(SubscriptionFilter {
                customer_id: Some(customer.id.clone()),
                ..SubscriptionFilter::default()
            })
            .await?;

        let mut members = None;
        for sub in subs.iter().filter(|s| s.is_active()) {
            let plan = self.directory.get_plan(&sub.plan_id).await?;
            for product in plan
                .products
                .iter()
                .filter(|p| p.is_per_seat() && p.config.seat_limit > 0)
            {
                let count = match members {
                    Some(count) => count,
                    None => {
                        let count = self.directory.member_count(&customer.org_id).await?;
                        members = Some(count);
                        count
                    }
                };
                if let Err(e) = product.check_seat_limit(count) {
                    tracing::info!(
                        target: "tideway::billing::entitlements",
                        customer_id,
                        plan_id = %plan.id,
                        product_id = %product.id,
                        members = count,
                        "Seat limit exceeded"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn resolve_products(&self, id: &str) -> Result<Vec<Product>> {
        match self.directory.get_feature(id).await {
            Ok(feature) => self.directory.list_products(&feature.product_ids).await,
            Err(BillingError::FeatureNotFound { .. }) => Ok(vec![self.directory.get_product(id).await?]),
            Err(e) => Err(e),
        }
    }
}
