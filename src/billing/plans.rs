//! Plan, product, price and feature catalog.
//!
//! The catalog is read-only from the billing core's perspective. Implement
//! [`PlanDirectory`] and [`ProductDirectory`] over wherever plans live (admin
//! database, static config...).
//!
//! ```rust,ignore
//! use tideway_billing::billing::{Plan, Product, Price};
//!
//! let plan = Plan::builder("team_monthly")
//!     .interval("month")
//!     .trial_days(14)
//!     .on_start_credits(500)
//!     .product(
//!         Product::builder("seats")
//!             .provider_id("prod_seats")
//!             .per_seat(10)
//!             .price(Price::licensed("price_seat_monthly", "month"))
//!             .plans(["team_monthly"])
//!             .build(),
//!     )
//!     .build();
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::Result;

/// A purchasable plan: a bundle of priced products billed on one interval.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub title: String,
    /// Billing interval shared by every price used from this plan ("month", "year").
    pub interval: String,
    pub trial_days: i64,
    /// Credits granted once per customer when the plan starts.
    pub on_start_credits: i64,
    pub products: Vec<Product>,
    pub metadata: HashMap<String, String>,
}

impl Plan {
    /// Start building a plan.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> PlanBuilder {
        PlanBuilder::new(id)
    }

    /// The product whose quantity tracks the organization member count.
    #[must_use]
    pub fn seat_product(&self) -> Option<&Product> {
        self.products.iter().find(|p| p.behavior == ProductBehavior::PerSeat)
    }

    /// Prices of `product` billed on this plan's interval.
    pub fn interval_prices<'a>(&'a self, product: &'a Product) -> impl Iterator<Item = &'a Price> {
        product
            .prices
            .iter()
            .filter(move |price| price.interval == self.interval)
    }

    /// Display label, falling back to the name.
    #[must_use]
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() { &self.name } else { &self.title }
    }
}

/// How a product is billed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductBehavior {
    /// Flat price per interval.
    #[default]
    Basic,
    /// One-time credit pack; never part of a subscription.
    Credits,
    /// Quantity follows the organization's member count.
    PerSeat,
}

/// Product-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    /// Maximum members for per-seat products (0 = unlimited).
    pub seat_limit: i64,
    /// Credits granted when a credit pack is purchased.
    pub credit_amount: i64,
}

/// A billable product.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    /// Product id at the payment provider.
    pub provider_id: String,
    pub name: String,
    pub title: String,
    pub behavior: ProductBehavior,
    pub config: ProductConfig,
    pub prices: Vec<Price>,
    /// Plans this product is sold under.
    pub plan_ids: Vec<String>,
    pub features: Vec<Feature>,
}

impl Product {
    /// Start building a product.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ProductBuilder {
        ProductBuilder::new(id)
    }

    #[must_use]
    pub fn is_per_seat(&self) -> bool {
        self.behavior == ProductBehavior::PerSeat
    }

    /// Whether the product may be used under `plan_id`.
    #[must_use]
    pub fn allows_plan(&self, plan_id: &str) -> bool {
        self.plan_ids.iter().any(|id| id == plan_id)
    }

    /// Fails when `members` exceeds a configured seat limit.
    pub fn check_seat_limit(&self, members: i64) -> Result<()> {
        if self.is_per_seat() && self.config.seat_limit > 0 && members > self.config.seat_limit {
            return Err(super::error::BillingError::PerSeatLimitReached {
                limit: self.config.seat_limit,
                members,
            });
        }
        Ok(())
    }
}

/// Whether a price is charged per unit up front or metered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceUsageType {
    #[default]
    Licensed,
    Metered,
}

/// A price attached to a product.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    /// Price id at the payment provider.
    pub provider_id: String,
    pub interval: String,
    pub usage_type: PriceUsageType,
    pub amount: i64,
    pub currency: String,
}

impl Price {
    /// A licensed price whose local and provider ids are the same.
    #[must_use]
    pub fn licensed(provider_id: impl Into<String>, interval: impl Into<String>) -> Self {
        let provider_id = provider_id.into();
        Self {
            id: provider_id.clone(),
            provider_id,
            interval: interval.into(),
            usage_type: PriceUsageType::Licensed,
            amount: 0,
            currency: "usd".to_string(),
        }
    }

    /// A metered price whose local and provider ids are the same.
    #[must_use]
    pub fn metered(provider_id: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            usage_type: PriceUsageType::Metered,
            ..Self::licensed(provider_id, interval)
        }
    }
}

/// A named capability granted by one or more products.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub product_ids: Vec<String>,
}

/// Filter for listing plans.
#[derive(Clone, Debug, Default)]
pub struct PlanFilter {
    pub ids: Vec<String>,
    pub interval: Option<String>,
}

/// Read access to plans.
#[async_trait]
pub trait PlanDirectory: Send + Sync {
    /// Get a plan with its nested products.
    ///
    /// Returns `BillingError::PlanNotFound` when the id is unknown.
    async fn get_plan(&self, id: &str) -> Result<Plan>;

    /// List plans matching the filter.
    async fn list_plans(&self, filter: PlanFilter) -> Result<Vec<Plan>>;
}

/// Read access to products and features.
#[async_trait]
pub trait ProductDirectory: Send + Sync {
    /// Returns `BillingError::ProductNotFound` when the id is unknown.
    async fn get_product(&self, id: &str) -> Result<Product>;

    /// Look up a product by its provider-side id.
    async fn get_product_by_provider_id(&self, provider_id: &str) -> Result<Product>;

    /// Fetch every product whose id is in `ids`; unknown ids are skipped.
    async fn list_products(&self, ids: &[String]) -> Result<Vec<Product>>;

    /// Returns `BillingError::FeatureNotFound` when the id is unknown.
    async fn get_feature(&self, id: &str) -> Result<Feature>;
}

/// Builder for [`Plan`].
#[derive(Debug)]
#[must_use = "builder does nothing until you call build()"]
pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            plan: Plan {
                name: id.clone(),
                id,
                interval: "month".to_string(),
                ..Plan::default()
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.plan.name = name.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.plan.title = title.to_string();
        self
    }

    pub fn interval(mut self, interval: &str) -> Self {
        self.plan.interval = interval.to_string();
        self
    }

    pub fn trial_days(mut self, days: i64) -> Self {
        self.plan.trial_days = days;
        self
    }

    pub fn on_start_credits(mut self, credits: i64) -> Self {
        self.plan.on_start_credits = credits;
        self
    }

    pub fn product(mut self, product: Product) -> Self {
        self.plan.products.push(product);
        self
    }

    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.plan.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Plan {
        self.plan
    }
}

/// Builder for [`Product`].
#[derive(Debug)]
#[must_use = "builder does nothing until you call build()"]
pub struct ProductBuilder {
    product: Product,
}

impl ProductBuilder {
    fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            product: Product {
                name: id.clone(),
                provider_id: format!("prod_{}", id),
                id,
                ..Product::default()
            },
        }
    }

    pub fn provider_id(mut self, provider_id: &str) -> Self {
        self.product.provider_id = provider_id.to_string();
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.product.title = title.to_string();
        self
    }

    /// Bill per organization member, capped at `seat_limit` (0 = no cap).
    pub fn per_seat(mut self, seat_limit: i64) -> Self {
        self.product.behavior = ProductBehavior::PerSeat;
        self.product.config.seat_limit = seat_limit;
        self
    }

    /// Sell the product as a one-time pack of `amount` credits.
    pub fn credits(mut self, amount: i64) -> Self {
        self.product.behavior = ProductBehavior::Credits;
        self.product.config.credit_amount = amount;
        self
    }

    pub fn price(mut self, price: Price) -> Self {
        self.product.prices.push(price);
        self
    }

    pub fn plans<I, S>(mut self, plan_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.product.plan_ids = plan_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.product.features.push(feature);
        self
    }

    pub fn build(self) -> Product {
        self.product
    }
}
