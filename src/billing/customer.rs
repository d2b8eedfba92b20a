//! Billing customers and their reconciliation with the payment provider.
//!
//! Customers are owned by the platform's customer directory. The billing
//! core reads them for balances and overdraft floors, and mirrors contact
//! details from the provider when the provider reports a change.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::client::{PaymentProviderClient, ProviderCustomer};
use super::error::{BillingError, Result};
use super::storage::{BillingStore, CustomerFilter};

/// Customer account state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerState {
    #[default]
    Active,
    /// The customer was deleted at the provider.
    Disabled,
}

/// A billing customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub org_id: String,
    /// Customer id at the payment provider.
    pub provider_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub currency: String,
    /// Overdraft floor for deductions.
    ///
    /// Negative values allow the balance to go below zero down to this
    /// value; positive values require that much to remain after deducting.
    pub credit_min: i64,
    pub state: CustomerState,
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Customer {
    #[must_use]
    pub fn new(id: impl Into<String>, org_id: impl Into<String>) -> Self {
        let now = super::current_timestamp();
        Self {
            id: id.into(),
            org_id: org_id.into(),
            currency: "usd".to_string(),
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    #[must_use]
    pub fn with_credit_min(mut self, credit_min: i64) -> Self {
        self.credit_min = credit_min;
        self
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == CustomerState::Active
    }

    /// Apply provider-side details. Returns whether anything changed.
    fn apply_provider(&mut self, remote: &ProviderCustomer) -> bool {
        let before = self.clone();
        if remote.deleted {
            self.state = CustomerState::Disabled;
        } else {
            self.phone = remote.phone.clone();
            if !remote.email.is_empty() {
                self.email = remote.email.clone();
            }
            self.name = remote.name.clone();
            if !remote.currency.is_empty() {
                self.currency = remote.currency.clone();
            }
        }
        *self != before
    }
}

/// Mirrors provider customer data into the customer repository.
#[derive(Clone)]
pub struct CustomerSyncer<S: BillingStore, C: PaymentProviderClient> {
    store: S,
    client: C,
    sync_lock: Arc<Mutex<()>>,
}

impl<S: BillingStore, C: PaymentProviderClient> CustomerSyncer<S, C> {
    #[must_use]
    pub fn new(store: S, client: C) -> Self {
        Self {
            store,
            client,
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Pull the provider customer and store any changed details.
    pub async fn sync_with_provider(&self, customer: &Customer) -> Result<Customer> {
        let _guard = self.sync_lock.lock().await;

        let remote = self.client.get_customer(&customer.provider_id).await?;

        let mut updated = customer.clone();
        if !updated.apply_provider(&remote) {
            return Ok(updated);
        }
        updated.updated_at = super::current_timestamp();
        self.store.update_customer(updated.clone()).await?;

        tracing::info!(
            target: "tideway::billing::customer",
            customer_id = %updated.id,
            disabled = remote.deleted,
            "Customer synced from provider"
        );
        Ok(updated)
    }

    /// Sync every customer linked to `provider_id` (webhook path).
    pub async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        let customers = self
            .store
            .list_customers(CustomerFilter {
                provider_id: Some(provider_id.to_string()),
                ..CustomerFilter::default()
            })
            .await?;
        if customers.is_empty() {
            return Err(BillingError::CustomerNotFound {
                id: provider_id.to_string(),
            });
        }
        for customer in customers {
            self.sync_with_provider(&customer).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::client::test::MockProviderClient;
    use crate::billing::storage::CustomerRepository;
    use crate::billing::storage::test::InMemoryBillingStore;

    fn setup() -> (InMemoryBillingStore, MockProviderClient, CustomerSyncer<InMemoryBillingStore, MockProviderClient>) {
        let store = InMemoryBillingStore::new();
        let client = MockProviderClient::new();
        let syncer = CustomerSyncer::new(store.clone(), client.clone());
        (store, client, syncer)
    }

    #[tokio::test]
    async fn test_sync_mirrors_contact_details() {
        let (store, client, syncer) = setup();
        store.add_customer(Customer::new("c1", "org_1").with_provider_id("cus_1"));
        client.set_customer(ProviderCustomer {
            id: "cus_1".to_string(),
            name: "Acme".to_string(),
            email: "billing@acme.test".to_string(),
            phone: "+100".to_string(),
            currency: "eur".to_string(),
            deleted: false,
        });

        syncer.trigger_sync_by_provider_id("cus_1").await.unwrap();

        let stored = store.get_customer("c1").await.unwrap();
        assert_eq!(stored.name, "Acme");
        assert_eq!(stored.email, "billing@acme.test");
        assert_eq!(stored.currency, "eur");
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn test_empty_email_keeps_existing() {
        let (store, client, syncer) = setup();
        let mut customer = Customer::new("c1", "org_1").with_provider_id("cus_1");
        customer.email = "old@acme.test".to_string();
        store.add_customer(customer.clone());
        client.set_customer(ProviderCustomer {
            id: "cus_1".to_string(),
            name: "Acme".to_string(),
            ..ProviderCustomer::default()
        });

        let synced = syncer.sync_with_provider(&customer).await.unwrap();
        assert_eq!(synced.email, "old@acme.test");
        assert_eq!(synced.currency, "usd");
    }

    #[tokio::test]
    async fn test_deleted_customer_is_disabled() {
        let (store, client, syncer) = setup();
        store.add_customer(Customer::new("c1", "org_1").with_provider_id("cus_1"));
        client.set_customer(ProviderCustomer {
            id: "cus_1".to_string(),
            deleted: true,
            ..ProviderCustomer::default()
        });

        syncer.trigger_sync_by_provider_id("cus_1").await.unwrap();
        let stored = store.get_customer("c1").await.unwrap();
        assert_eq!(stored.state, CustomerState::Disabled);
    }

    #[tokio::test]
    async fn test_unknown_provider_id() {
        let (_store, _client, syncer) = setup();
        let result = syncer.trigger_sync_by_provider_id("cus_missing").await;
        assert!(matches!(result, Err(BillingError::CustomerNotFound { .. })));
    }
}
