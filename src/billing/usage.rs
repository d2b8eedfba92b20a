//! Usage reporting against the credit ledger.
//!
//! Reported usage is a write-once event. Credit usage is deducted from the
//! customer's balance; the usage id is the ledger idempotency key, so a
//! retried report never charges twice.
//!
//! # Example
//!
//! ```rust,ignore
//! use tideway_billing::billing::{Usage, UsageReporter};
//!
//! let reporter = UsageReporter::new(ledger);
//! reporter.report(vec![
//!     Usage::credit("req-123", customer_id, 5),
//!     Usage::credit("req-124", customer_id, 2),
//! ]).await?;
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::ledger::{Credit, Ledger, TransactionType};
use super::storage::BillingStore;

/// Source recorded on revert credits.
pub const REVERT_SOURCE: &str = "system.revert";

/// What a usage event consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    /// Deducted from the prepaid credit balance.
    #[default]
    Credit,
    /// Feature usage; not billable through credits.
    Feature,
}

impl UsageType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Feature => "feature",
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reported usage event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Idempotency key.
    pub id: String,
    pub customer_id: String,
    pub source: String,
    pub description: String,
    #[serde(rename = "type")]
    pub usage_type: UsageType,
    pub amount: i64,
    pub user_id: String,
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
}

impl Usage {
    /// A credit usage of `amount` for the customer.
    #[must_use]
    pub fn credit(id: impl Into<String>, customer_id: impl Into<String>, amount: i64) -> Self {
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            usage_type: UsageType::Credit,
            amount,
            created_at: super::current_timestamp(),
            ..Self::default()
        }
    }
}

/// Applies reported usage to the ledger.
#[derive(Clone)]
pub struct UsageReporter<S: BillingStore> {
    ledger: Ledger<S>,
}

impl<S: BillingStore> UsageReporter<S> {
    #[must_use]
    pub fn new(ledger: Ledger<S>) -> Self {
        Self { ledger }
    }

    /// Apply a batch of usage events.
    ///
    /// Each item is applied independently: a failing item does not stop the
    /// rest of the batch. Failures come back as `BillingError::Batch` keyed
    /// by usage id, even when only one item failed.
    pub async fn report(&self, usages: Vec<Usage>) -> Result<()> {
        let mut errors = Vec::new();
        for usage in usages {
            let id = usage.id.clone();
            let outcome = match usage.usage_type {
                UsageType::Credit => self.ledger.deduct(usage).await,
                other => Err(BillingError::invalid_detail(format!(
                    "unsupported usage type: {}",
                    other
                ))),
            };
            if let Err(e) = outcome {
                tracing::warn!(
                    target: "tideway::billing::usage",
                    usage_id = %id,
                    error = %e,
                    "Usage not applied"
                );
                errors.push((id, e));
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(BillingError::Batch { errors })
    }

    /// Refund `amount` of a previous credit usage back to the customer.
    ///
    /// A usage can be reverted once, for at most the amount it deducted.
    pub async fn revert(&self, customer_id: &str, usage_id: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(BillingError::invalid_detail("revert amount must be positive"));
        }
        let original = self.ledger.get_by_id(usage_id).await?;
        if original.account_id != customer_id || original.tx_type != TransactionType::Debit {
            return Err(BillingError::invalid_detail(format!(
                "usage {} is not a deduction of customer {}",
                usage_id, customer_id
            )));
        }
        if amount > original.amount {
            return Err(BillingError::invalid_detail(format!(
                "revert amount {} exceeds usage amount {}",
                amount, original.amount
            )));
        }

        let mut credit = Credit::new(format!("revert:{}", usage_id), customer_id, amount)
            .with_source(REVERT_SOURCE)
            .with_description(format!("revert of usage {}", usage_id));
        credit.user_id = original.user_id;
        credit.metadata.insert("usage_id".to_string(), usage_id.to_string());
        self.ledger.add(credit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::customer::Customer;
    use crate::billing::storage::test::InMemoryBillingStore;

    async fn setup(balance: i64) -> UsageReporter<InMemoryBillingStore> {
        let store = InMemoryBillingStore::new();
        store.add_customer(Customer::new("c1", "org_1"));
        let ledger = Ledger::new(store);
        if balance > 0 {
            ledger.add(Credit::new("seed", "c1", balance)).await.unwrap();
        }
        UsageReporter::new(ledger)
    }

    #[tokio::test]
    async fn test_insufficient_balance_names_usage() {
        let reporter = setup(30).await;

        let err = reporter
            .report(vec![Usage::credit("u1", "c1", 50)])
            .await
            .unwrap_err();
        assert_eq!(err.failed_ids(), vec!["u1"]);
        assert!(matches!(
            &err,
            BillingError::Batch { errors } if matches!(errors[0].1, BillingError::NotEnough { .. })
        ));
        assert!(err.to_string().contains("u1: Insufficient credits"));
        assert_eq!(reporter.ledger.get_balance("c1").await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_partial_batch_commits_valid_items() {
        let reporter = setup(30).await;
        let mut feature = Usage::credit("u2", "c1", 1);
        feature.usage_type = UsageType::Feature;

        let err = reporter
            .report(vec![
                Usage::credit("u1", "c1", 50),
                feature,
                Usage::credit("u3", "c1", 10),
            ])
            .await
            .unwrap_err();

        assert_eq!(err.failed_ids(), vec!["u1", "u2"]);
        assert!(err.to_string().contains("u1"));
        assert_eq!(reporter.ledger.get_balance("c1").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_all_applied() {
        let reporter = setup(10).await;
        reporter
            .report(vec![Usage::credit("u1", "c1", 4), Usage::credit("u2", "c1", 6)])
            .await
            .unwrap();
        assert_eq!(reporter.ledger.get_balance("c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revert_refunds_once() {
        let reporter = setup(100).await;
        reporter.report(vec![Usage::credit("u1", "c1", 40)]).await.unwrap();

        assert!(matches!(
            reporter.revert("c1", "u1", 41).await,
            Err(BillingError::InvalidDetail { .. })
        ));

        reporter.revert("c1", "u1", 40).await.unwrap();
        assert_eq!(reporter.ledger.get_balance("c1").await.unwrap(), 100);

        assert!(matches!(
            reporter.revert("c1", "u1", 10).await,
            Err(BillingError::AlreadyApplied { .. })
        ));
    }

    #[tokio::test]
    async fn test_revert_rejects_foreign_usage() {
        let reporter = setup(100).await;
        reporter.report(vec![Usage::credit("u1", "c1", 40)]).await.unwrap();
        assert!(matches!(
            reporter.revert("c2", "u1", 10).await,
            Err(BillingError::InvalidDetail { .. })
        ));
        assert!(matches!(
            reporter.revert("c1", "missing", 10).await,
            Err(BillingError::TransactionNotFound { .. })
        ));
    }
}
