//! Read-only directories the billing core consults.
//!
//! [`Directory`] bundles the plan catalog and organization membership so
//! engines take one collaborator instead of four.

use async_trait::async_trait;

use super::error::Result;
use super::plans::{PlanDirectory, ProductDirectory};

/// Organization membership lookups.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    /// Live number of members in the organization.
    async fn member_count(&self, org_id: &str) -> Result<i64>;
}

/// Everything the engines read but never write.
///
/// Blanket-implemented for any cloneable type providing the individual
/// directory traits.
pub trait Directory:
    PlanDirectory + ProductDirectory + OrganizationDirectory + Clone + 'static
{
}

impl<T> Directory for T where
    T: PlanDirectory + ProductDirectory + OrganizationDirectory + Clone + 'static
{
}

#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::plans::{Feature, Plan, PlanFilter, Product};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory plan catalog and organization directory for testing.
    #[derive(Default, Clone)]
    pub struct InMemoryDirectory {
        inner: Arc<InMemoryDirectoryInner>,
    }

    #[derive(Default)]
    struct InMemoryDirectoryInner {
        plans: RwLock<HashMap<String, Plan>>,
        products: RwLock<HashMap<String, Product>>,
        features: RwLock<HashMap<String, Feature>>,
        members: RwLock<HashMap<String, i64>>,
        fail_plan_lookups: AtomicBool,
    }

    impl InMemoryDirectory {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Add a plan and register each of its products.
        pub fn add_plan(&self, plan: Plan) {
            for product in &plan.products {
                self.add_product(product.clone());
            }
            self.inner.plans.write().unwrap().insert(plan.id.clone(), plan);
        }

        /// Add a product and the features it declares.
        pub fn add_product(&self, product: Product) {
            for feature in &product.features {
                self.add_feature(feature.clone());
            }
            self.inner
                .products
                .write()
                .unwrap()
                .insert(product.id.clone(), product);
        }

        pub fn add_feature(&self, feature: Feature) {
            self.inner
                .features
                .write()
                .unwrap()
                .insert(feature.id.clone(), feature);
        }

        pub fn set_member_count(&self, org_id: &str, count: i64) {
            self.inner
                .members
                .write()
                .unwrap()
                .insert(org_id.to_string(), count);
        }

        /// Make every plan lookup fail with an internal error.
        pub fn fail_plan_lookups(&self, fail: bool) {
            self.inner.fail_plan_lookups.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PlanDirectory for InMemoryDirectory {
        async fn get_plan(&self, id: &str) -> Result<Plan> {
            if self.inner.fail_plan_lookups.load(Ordering::SeqCst) {
                return Err(BillingError::internal("plan directory unavailable"));
            }
            self.inner
                .plans
                .read()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| BillingError::PlanNotFound { id: id.to_string() })
        }

        async fn list_plans(&self, filter: PlanFilter) -> Result<Vec<Plan>> {
            let plans = self.inner.plans.read().unwrap();
            let mut matched: Vec<Plan> = plans
                .values()
                .filter(|p| filter.ids.is_empty() || filter.ids.contains(&p.id))
                .filter(|p| filter.interval.as_ref().is_none_or(|i| &p.interval == i))
                .cloned()
                .collect();
            matched.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(matched)
        }
    }

    #[async_trait]
    impl ProductDirectory for InMemoryDirectory {
        async fn get_product(&self, id: &str) -> Result<Product> {
            self.inner
                .products
                .read()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| BillingError::ProductNotFound { id: id.to_string() })
        }

        async fn get_product_by_provider_id(&self, provider_id: &str) -> Result<Product> {
            self.inner
                .products
                .read()
                .unwrap()
                .values()
                .find(|p| p.provider_id == provider_id)
                .cloned()
                .ok_or_else(|| BillingError::ProductNotFound {
                    id: provider_id.to_string(),
                })
        }

        async fn list_products(&self, ids: &[String]) -> Result<Vec<Product>> {
            let products = self.inner.products.read().unwrap();
            Ok(ids.iter().filter_map(|id| products.get(id).cloned()).collect())
        }

        async fn get_feature(&self, id: &str) -> Result<Feature> {
            self.inner
                .features
                .read()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| BillingError::FeatureNotFound { id: id.to_string() })
        }
    }

    #[async_trait]
    impl OrganizationDirectory for InMemoryDirectory {
        async fn member_count(&self, org_id: &str) -> Result<i64> {
            Ok(self
                .inner
                .members
                .read()
                .unwrap()
                .get(org_id)
                .copied()
                .unwrap_or(1))
        }
    }
}
