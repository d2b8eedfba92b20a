//! Repository traits for billing data.
//!
//! Implement these traits to persist billing state to your database. The
//! engines are generic over [`BillingStore`], which is implemented for any
//! type providing all five repositories. An in-memory implementation is
//! provided for testing.

use async_trait::async_trait;

use super::checkout::{Checkout, CheckoutState};
use super::customer::{Customer, CustomerState};
use super::error::Result;
use super::invoice::{Invoice, InvoiceState};
use super::ledger::Transaction;
use super::subscription::{Subscription, SubscriptionState};

/// Overdraft check evaluated atomically with a ledger insert.
///
/// The debit leg of the entry is rejected with `BillingError::NotEnough` when
/// `balance - credit_min < debit.amount` for `account_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceGuard {
    pub account_id: String,
    pub credit_min: i64,
}

impl BalanceGuard {
    /// Whether `amount` can be deducted from `balance` under this floor.
    #[must_use]
    pub fn allows(&self, balance: i64, amount: i64) -> bool {
        balance - self.credit_min >= amount
    }
}

/// Filter for listing ledger transactions.
///
/// `start` is inclusive and `end` exclusive, both unix seconds.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub account_id: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub limit: Option<usize>,
}

/// Filter for listing checkouts.
#[derive(Debug, Clone, Default)]
pub struct CheckoutFilter {
    pub customer_id: Option<String>,
    pub provider_id: Option<String>,
    pub state: Option<CheckoutState>,
}

/// Filter for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub customer_id: Option<String>,
    pub provider_id: Option<String>,
    pub plan_id: Option<String>,
    pub state: Option<SubscriptionState>,
}

/// Filter for listing customers.
#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    pub org_id: Option<String>,
    pub provider_id: Option<String>,
    pub state: Option<CustomerState>,
}

/// Filter for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub customer_id: Option<String>,
    pub provider_id: Option<String>,
    pub state: Option<InvoiceState>,
    /// Skip invoices with a zero amount.
    pub non_zero_only: bool,
}

/// Append-only ledger storage.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert both legs of a double-entry transaction atomically.
    ///
    /// Fails with `BillingError::AlreadyApplied` when either leg's id is
    /// already stored, with `BillingError::InvalidId` when both ids are empty,
    /// and with `BillingError::NotEnough` when `guard` rejects the debit.
    /// Production implementations must evaluate the guard in the same
    /// serializable transaction as the insert.
    async fn create_entry(
        &self,
        debit: Transaction,
        credit: Transaction,
        guard: Option<BalanceGuard>,
    ) -> Result<()>;

    /// Returns `BillingError::TransactionNotFound` when the id is unknown.
    async fn get_transaction(&self, id: &str) -> Result<Transaction>;

    /// Credits minus debits for the account.
    async fn get_balance(&self, account_id: &str) -> Result<i64>;

    /// Sum of every debit on the account.
    async fn get_total_debited_amount(&self, account_id: &str) -> Result<i64>;

    /// Credits minus debits created in `[start, end)`.
    async fn get_balance_for_range(&self, account_id: &str, start: u64, end: u64) -> Result<i64>;

    async fn list_transactions(&self, filter: TransactionFilter) -> Result<Vec<Transaction>>;
}

/// Checkout storage.
#[async_trait]
pub trait CheckoutRepository: Send + Sync {
    async fn create_checkout(&self, checkout: Checkout) -> Result<Checkout>;

    /// Returns `BillingError::CheckoutNotFound` when the id is unknown.
    async fn get_checkout(&self, id: &str) -> Result<Checkout>;

    /// Replace the stored checkout with the same id.
    async fn update_checkout(&self, checkout: Checkout) -> Result<Checkout>;

    async fn list_checkouts(&self, filter: CheckoutFilter) -> Result<Vec<Checkout>>;
}

/// Subscription storage.
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create_subscription(&self, subscription: Subscription) -> Result<Subscription>;

    /// Returns `BillingError::SubscriptionNotFound` when the id is unknown.
    async fn get_subscription(&self, id: &str) -> Result<Subscription>;

    /// Returns `BillingError::SubscriptionNotFound` when no subscription
    /// carries the provider id.
    async fn get_subscription_by_provider_id(&self, provider_id: &str) -> Result<Subscription>;

    async fn update_subscription(&self, subscription: Subscription) -> Result<Subscription>;

    async fn list_subscriptions(&self, filter: SubscriptionFilter) -> Result<Vec<Subscription>>;

    async fn delete_subscription(&self, id: &str) -> Result<()>;
}

/// Customer directory access.
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    /// Returns `BillingError::CustomerNotFound` when the id is unknown.
    async fn get_customer(&self, id: &str) -> Result<Customer>;

    async fn get_customer_by_provider_id(&self, provider_id: &str) -> Result<Customer>;

    async fn list_customers(&self, filter: CustomerFilter) -> Result<Vec<Customer>>;

    async fn update_customer(&self, customer: Customer) -> Result<Customer>;
}

/// Local copies of provider invoices.
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice>;

    /// Fails with `BillingError::InvoiceNotFound` for an unknown id.
    async fn get_invoice(&self, id: &str) -> Result<Invoice>;

    async fn update_invoice(&self, invoice: Invoice) -> Result<Invoice>;

    /// Ordered by creation time, oldest first.
    async fn list_invoices(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>>;

    async fn delete_invoice(&self, id: &str) -> Result<()>;
}

/// Every repository the billing engines need.
///
/// Blanket-implemented; engines clone the store into background tasks.
pub trait BillingStore:
    TransactionRepository
    + CheckoutRepository
    + SubscriptionRepository
    + CustomerRepository
    + InvoiceRepository
    + Clone
    + 'static
{
}

impl<T> BillingStore for T where
    T: TransactionRepository
        + CheckoutRepository
        + SubscriptionRepository
        + CustomerRepository
        + InvoiceRepository
        + Clone
        + 'static
{
}

/// In-memory billing store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::ledger::TransactionType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory billing store for testing.
    ///
    /// Records keep insertion order so list results are deterministic.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<InMemoryBillingStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryBillingStoreInner {
        transactions: RwLock<Vec<Transaction>>,
        checkouts: RwLock<Vec<Checkout>>,
        subscriptions: RwLock<Vec<Subscription>>,
        customers: RwLock<Vec<Customer>>,
        invoices: RwLock<Vec<Invoice>>,
        fail_transaction_lookups: AtomicBool,
    }

    impl InMemoryBillingStore {
        /// Create a new empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a customer.
        pub fn add_customer(&self, customer: Customer) {
            let mut customers = self.inner.customers.write().unwrap();
            customers.retain(|c| c.id != customer.id);
            customers.push(customer);
        }

        /// Snapshot of every stored transaction.
        pub fn transactions(&self) -> Vec<Transaction> {
            self.inner.transactions.read().unwrap().clone()
        }

        /// Snapshot of every stored checkout.
        pub fn checkouts(&self) -> Vec<Checkout> {
            self.inner.checkouts.read().unwrap().clone()
        }

        /// Snapshot of every stored subscription.
        pub fn subscriptions(&self) -> Vec<Subscription> {
            self.inner.subscriptions.read().unwrap().clone()
        }

        /// Snapshot of every stored invoice.
        pub fn invoices(&self) -> Vec<Invoice> {
            self.inner.invoices.read().unwrap().clone()
        }

        /// Make `get_transaction` fail with an internal error.
        pub fn fail_transaction_lookups(&self, fail: bool) {
            self.inner.fail_transaction_lookups.store(fail, Ordering::SeqCst);
        }
    }

    fn signed(tx: &Transaction) -> i64 {
        match tx.tx_type {
            TransactionType::Credit => tx.amount,
            TransactionType::Debit => -tx.amount,
        }
    }

    fn balance_of(transactions: &[Transaction], account_id: &str) -> i64 {
        transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .map(signed)
            .sum()
    }

    #[async_trait]
    impl TransactionRepository for InMemoryBillingStore {
        async fn create_entry(
            &self,
            debit: Transaction,
            credit: Transaction,
            guard: Option<BalanceGuard>,
        ) -> Result<()> {
            if debit.id.is_empty() && credit.id.is_empty() {
                return Err(BillingError::InvalidId {
                    id: String::new(),
                    reason: "transaction id must not be empty".to_string(),
                });
            }

            // One write lock covers the duplicate check, balance check and insert.
            let mut transactions = self.inner.transactions.write().unwrap();
            for leg in [&debit, &credit] {
                if !leg.id.is_empty() && transactions.iter().any(|t| t.id == leg.id) {
                    return Err(BillingError::AlreadyApplied { id: leg.id.clone() });
                }
            }
            if let Some(guard) = guard {
                let balance = balance_of(&transactions, &guard.account_id);
                if !guard.allows(balance, debit.amount) {
                    return Err(BillingError::NotEnough {
                        account_id: guard.account_id,
                        requested: debit.amount,
                        available: balance - guard.credit_min,
                    });
                }
            }
            transactions.push(debit);
            transactions.push(credit);
            Ok(())
        }

        async fn get_transaction(&self, id: &str) -> Result<Transaction> {
            if self.inner.fail_transaction_lookups.load(Ordering::SeqCst) {
                return Err(BillingError::internal("transaction store unavailable"));
            }
            self.inner
                .transactions
                .read()
                .unwrap()
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| BillingError::TransactionNotFound { id: id.to_string() })
        }

        async fn get_balance(&self, account_id: &str) -> Result<i64> {
            Ok(balance_of(&self.inner.transactions.read().unwrap(), account_id))
        }

        async fn get_total_debited_amount(&self, account_id: &str) -> Result<i64> {
            Ok(self
                .inner
                .transactions
                .read()
                .unwrap()
                .iter()
                .filter(|t| t.account_id == account_id && t.tx_type == TransactionType::Debit)
                .map(|t| t.amount)
                .sum())
        }

        async fn get_balance_for_range(&self, account_id: &str, start: u64, end: u64) -> Result<i64> {
            Ok(self
                .inner
                .transactions
                .read()
                .unwrap()
                .iter()
                .filter(|t| t.account_id == account_id)
                .filter(|t| t.created_at >= start && t.created_at < end)
                .map(signed)
                .sum())
        }

        async fn list_transactions(&self, filter: TransactionFilter) -> Result<Vec<Transaction>> {
            let transactions = self.inner.transactions.read().unwrap();
            let matched = transactions
                .iter()
                .filter(|t| filter.account_id.as_ref().is_none_or(|a| &t.account_id == a))
                .filter(|t| filter.start.is_none_or(|s| t.created_at >= s))
                .filter(|t| filter.end.is_none_or(|e| t.created_at < e))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect();
            Ok(matched)
        }
    }

    #[async_trait]
    impl CheckoutRepository for InMemoryBillingStore {
        async fn create_checkout(&self, checkout: Checkout) -> Result<Checkout> {
            let mut checkouts = self.inner.checkouts.write().unwrap();
            if checkouts.iter().any(|c| c.id == checkout.id) {
                return Err(BillingError::invalid_detail(format!(
                    "checkout {} already exists",
                    checkout.id
                )));
            }
            checkouts.push(checkout.clone());
            Ok(checkout)
        }

        async fn get_checkout(&self, id: &str) -> Result<Checkout> {
            self.inner
                .checkouts
                .read()
                .unwrap()
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| BillingError::CheckoutNotFound { id: id.to_string() })
        }

        async fn update_checkout(&self, checkout: Checkout) -> Result<Checkout> {
            let mut checkouts = self.inner.checkouts.write().unwrap();
            let slot = checkouts
                .iter_mut()
                .find(|c| c.id == checkout.id)
                .ok_or_else(|| BillingError::CheckoutNotFound {
                    id: checkout.id.clone(),
                })?;
            *slot = checkout.clone();
            Ok(checkout)
        }

        async fn list_checkouts(&self, filter: CheckoutFilter) -> Result<Vec<Checkout>> {
            let checkouts = self.inner.checkouts.read().unwrap();
            Ok(checkouts
                .iter()
                .filter(|c| filter.customer_id.as_ref().is_none_or(|id| &c.customer_id == id))
                .filter(|c| filter.provider_id.as_ref().is_none_or(|id| &c.provider_id == id))
                .filter(|c| filter.state.as_ref().is_none_or(|s| &c.state == s))
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl SubscriptionRepository for InMemoryBillingStore {
        async fn create_subscription(&self, subscription: Subscription) -> Result<Subscription> {
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            if subscriptions.iter().any(|s| s.id == subscription.id) {
                return Err(BillingError::invalid_detail(format!(
                    "subscription {} already exists",
                    subscription.id
                )));
            }
            subscriptions.push(subscription.clone());
            Ok(subscription)
        }

        async fn get_subscription(&self, id: &str) -> Result<Subscription> {
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .ok_or_else(|| BillingError::SubscriptionNotFound { id: id.to_string() })
        }

        async fn get_subscription_by_provider_id(&self, provider_id: &str) -> Result<Subscription> {
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .iter()
                .find(|s| !s.provider_id.is_empty() && s.provider_id == provider_id)
                .cloned()
                .ok_or_else(|| BillingError::SubscriptionNotFound {
                    id: provider_id.to_string(),
                })
        }

        async fn update_subscription(&self, subscription: Subscription) -> Result<Subscription> {
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let slot = subscriptions
                .iter_mut()
                .find(|s| s.id == subscription.id)
                .ok_or_else(|| BillingError::SubscriptionNotFound {
                    id: subscription.id.clone(),
                })?;
            *slot = subscription.clone();
            Ok(subscription)
        }

        async fn list_subscriptions(&self, filter: SubscriptionFilter) -> Result<Vec<Subscription>> {
            let subscriptions = self.inner.subscriptions.read().unwrap();
            Ok(subscriptions
                .iter()
                .filter(|s| filter.customer_id.as_ref().is_none_or(|id| &s.customer_id == id))
                .filter(|s| filter.provider_id.as_ref().is_none_or(|id| &s.provider_id == id))
                .filter(|s| filter.plan_id.as_ref().is_none_or(|id| &s.plan_id == id))
                .filter(|s| filter.state.as_ref().is_none_or(|st| &s.state == st))
                .cloned()
                .collect())
        }

        async fn delete_subscription(&self, id: &str) -> Result<()> {
            let mut subscriptions = self.inner.subscriptions.write().unwrap();
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != id);
            if subscriptions.len() == before {
                return Err(BillingError::SubscriptionNotFound { id: id.to_string() });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CustomerRepository for InMemoryBillingStore {
        async fn get_customer(&self, id: &str) -> Result<Customer> {
            self.inner
                .customers
                .read()
                .unwrap()
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| BillingError::CustomerNotFound { id: id.to_string() })
        }

        async fn get_customer_by_provider_id(&self, provider_id: &str) -> Result<Customer> {
            self.inner
                .customers
                .read()
                .unwrap()
                .iter()
                .find(|c| c.provider_id == provider_id)
                .cloned()
                .ok_or_else(|| BillingError::CustomerNotFound {
                    id: provider_id.to_string(),
                })
        }

        async fn list_customers(&self, filter: CustomerFilter) -> Result<Vec<Customer>> {
            let customers = self.inner.customers.read().unwrap();
            Ok(customers
                .iter()
                .filter(|c| filter.org_id.as_ref().is_none_or(|id| &c.org_id == id))
                .filter(|c| filter.provider_id.as_ref().is_none_or(|id| &c.provider_id == id))
                .filter(|c| filter.state.is_none_or(|s| c.state == s))
                .cloned()
                .collect())
        }

        async fn update_customer(&self, customer: Customer) -> Result<Customer> {
            let mut customers = self.inner.customers.write().unwrap();
            let slot = customers
                .iter_mut()
                .find(|c| c.id == customer.id)
                .ok_or_else(|| BillingError::CustomerNotFound {
                    id: customer.id.clone(),
                })?;
            *slot = customer.clone();
            Ok(customer)
        }
    }

    #[async_trait]
    impl InvoiceRepository for InMemoryBillingStore {
        async fn create_invoice(&self, invoice: Invoice) -> Result<Invoice> {
            let mut invoices = self.inner.invoices.write().unwrap();
            if invoices.iter().any(|i| i.id == invoice.id) {
                return Err(BillingError::invalid_detail(format!(
                    "invoice {} already exists",
                    invoice.id
                )));
            }
            invoices.push(invoice.clone());
            Ok(invoice)
        }

        async fn get_invoice(&self, id: &str) -> Result<Invoice> {
            self.inner
                .invoices
                .read()
                .unwrap()
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(|| BillingError::InvoiceNotFound { id: id.to_string() })
        }

        async fn update_invoice(&self, invoice: Invoice) -> Result<Invoice> {
            let mut invoices = self.inner.invoices.write().unwrap();
            let slot = invoices
                .iter_mut()
                .find(|i| i.id == invoice.id)
                .ok_or_else(|| BillingError::InvoiceNotFound {
                    id: invoice.id.clone(),
                })?;
            *slot = invoice.clone();
            Ok(invoice)
        }

        async fn list_invoices(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>> {
            let mut invoices: Vec<_> = self
                .inner
                .invoices
                .read()
                .unwrap()
                .iter()
                .filter(|i| filter.customer_id.as_ref().is_none_or(|id| &i.customer_id == id))
                .filter(|i| filter.provider_id.as_ref().is_none_or(|id| &i.provider_id == id))
                .filter(|i| filter.state.as_ref().is_none_or(|st| &i.state == st))
                .filter(|i| !filter.non_zero_only || i.amount != 0)
                .cloned()
                .collect();
            invoices.sort_by_key(|i| i.created_at);
            Ok(invoices)
        }

        async fn delete_invoice(&self, id: &str) -> Result<()> {
            let mut invoices = self.inner.invoices.write().unwrap();
            let before = invoices.len();
            invoices.retain(|i| i.id != id);
            if invoices.len() == before {
                return Err(BillingError::InvoiceNotFound { id: id.to_string() });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryBillingStore;
    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::ledger::{Transaction, TransactionType};

    fn leg(id: &str, account: &str, tx_type: TransactionType, amount: i64, at: u64) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: account.to_string(),
            amount,
            tx_type,
            created_at: at,
            ..Transaction::default()
        }
    }

    #[test]
    fn test_balance_guard() {
        let floor = BalanceGuard {
            account_id: "c1".to_string(),
            credit_min: 0,
        };
        assert!(floor.allows(30, 30));
        assert!(!floor.allows(30, 31));

        let overdraft = BalanceGuard {
            account_id: "c1".to_string(),
            credit_min: -20,
        };
        assert!(overdraft.allows(30, 50));
        assert!(!overdraft.allows(30, 51));

        let reserve = BalanceGuard {
            account_id: "c1".to_string(),
            credit_min: 10,
        };
        assert!(reserve.allows(30, 20));
        assert!(!reserve.allows(30, 21));
    }

    #[tokio::test]
    async fn test_duplicate_leg_is_already_applied() {
        let store = InMemoryBillingStore::new();
        store
            .create_entry(
                leg("p1", "platform", TransactionType::Debit, 10, 1),
                leg("tx1", "c1", TransactionType::Credit, 10, 1),
                None,
            )
            .await
            .unwrap();

        let result = store
            .create_entry(
                leg("p2", "platform", TransactionType::Debit, 10, 2),
                leg("tx1", "c1", TransactionType::Credit, 10, 2),
                None,
            )
            .await;
        assert_eq!(result, Err(BillingError::AlreadyApplied { id: "tx1".to_string() }));
        assert_eq!(store.get_balance("c1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_guard_rejects_overdraft_without_writing() {
        let store = InMemoryBillingStore::new();
        store
            .create_entry(
                leg("p1", "platform", TransactionType::Debit, 30, 1),
                leg("tx1", "c1", TransactionType::Credit, 30, 1),
                None,
            )
            .await
            .unwrap();

        let result = store
            .create_entry(
                leg("u1", "c1", TransactionType::Debit, 50, 2),
                leg("p2", "platform", TransactionType::Credit, 50, 2),
                Some(BalanceGuard {
                    account_id: "c1".to_string(),
                    credit_min: 0,
                }),
            )
            .await;
        assert!(matches!(result, Err(BillingError::NotEnough { available: 30, .. })));
        assert_eq!(store.transactions().len(), 2);
    }

    #[tokio::test]
    async fn test_range_and_debited_amount() {
        let store = InMemoryBillingStore::new();
        store
            .create_entry(
                leg("p1", "platform", TransactionType::Debit, 100, 10),
                leg("tx1", "c1", TransactionType::Credit, 100, 10),
                None,
            )
            .await
            .unwrap();
        store
            .create_entry(
                leg("u1", "c1", TransactionType::Debit, 40, 20),
                leg("p2", "platform", TransactionType::Credit, 40, 20),
                None,
            )
            .await
            .unwrap();

        assert_eq!(store.get_total_debited_amount("c1").await.unwrap(), 40);
        assert_eq!(store.get_balance_for_range("c1", 10, 20).await.unwrap(), 100);
        assert_eq!(store.get_balance_for_range("c1", 10, 21).await.unwrap(), 60);

        let listed = store
            .list_transactions(TransactionFilter {
                account_id: Some("c1".to_string()),
                start: Some(15),
                ..TransactionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "u1");
    }

    #[tokio::test]
    async fn test_empty_ids_rejected() {
        let store = InMemoryBillingStore::new();
        let result = store
            .create_entry(
                leg("", "platform", TransactionType::Debit, 1, 1),
                leg("", "c1", TransactionType::Credit, 1, 1),
                None,
            )
            .await;
        assert!(matches!(result, Err(BillingError::InvalidId { .. })));
    }
}
