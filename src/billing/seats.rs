//! Seat quantity reconciliation.
//!
//! Per-seat products bill one unit per organization member. On every sync
//! the live member count is compared to the quantity on the provider's
//! subscription items and schedule phases, and pushed back when the
//! configured [`SeatChangeBehavior`] says so.

use serde::{Deserialize, Serialize};

use super::client::{PhaseItem, ProviderSubscriptionItem, SubscriptionItemUpdate};
use super::plans::{Plan, Product};

/// When a member count difference is pushed to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatChangeBehavior {
    /// Quantity always equals the member count, up or down.
    #[default]
    Exact,
    /// Quantity only grows; removed members stay billed until renewal.
    Incremental,
}

impl SeatChangeBehavior {
    /// Parse a case-insensitive behavior name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "incremental" => Some(Self::Incremental),
            _ => None,
        }
    }

    /// Whether a billed `quantity` should move to `members`.
    #[must_use]
    pub fn should_change_quantity(&self, quantity: i64, members: i64) -> bool {
        match self {
            Self::Exact => members != quantity,
            Self::Incremental => members > quantity,
        }
    }
}

/// Item quantity changes needed on a provider subscription.
///
/// Only items billed with one of the seat product's prices are considered.
#[must_use]
pub fn seat_item_updates(
    seat_product: &Product,
    items: &[ProviderSubscriptionItem],
    members: i64,
    behavior: SeatChangeBehavior,
) -> Vec<SubscriptionItemUpdate> {
    items
        .iter()
        .filter(|item| is_seat_price(seat_product, &item.price_provider_id))
        .filter(|item| behavior.should_change_quantity(item.quantity, members))
        .map(|item| SubscriptionItemUpdate {
            id: item.id.clone(),
            quantity: members,
        })
        .collect()
}

/// Apply the member count to seat-priced phase items in place.
///
/// Returns whether any item changed.
pub fn adjust_phase_items(
    seat_product: &Product,
    items: &mut [PhaseItem],
    members: i64,
    behavior: SeatChangeBehavior,
) -> bool {
    let mut changed = false;
    for item in items.iter_mut() {
        if !is_seat_price(seat_product, &item.price_provider_id) {
            continue;
        }
        let Some(quantity) = item.quantity else {
            continue;
        };
        if behavior.should_change_quantity(quantity, members) {
            item.quantity = Some(members);
            changed = true;
        }
    }
    changed
}

/// Yearly plans invoice added seats monthly instead of at renewal.
#[must_use]
pub fn pending_invoice_item_interval(plan: &Plan) -> Option<String> {
    (plan.interval == "year").then(|| "month".to_string())
}

fn is_seat_price(seat_product: &Product, price_provider_id: &str) -> bool {
    seat_product
        .prices
        .iter()
        .any(|price| price.provider_id == price_provider_id)
}
