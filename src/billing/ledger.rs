//! Double-entry credit ledger.
//!
//! Every credit or deduction writes two [`Transaction`]s of the same amount:
//! one on the customer account and the offsetting leg on the platform
//! account. The caller-supplied id keys the customer leg, so replaying the
//! same credit or usage is rejected with `BillingError::AlreadyApplied`.
//!
//! ```rust,ignore
//! let ledger = Ledger::new(store);
//!
//! ledger.add(Credit::new("welcome:c1", "c1", 500)).await?;
//! ledger.deduct(Usage::credit("u1", "c1", 30)).await?;
//!
//! assert_eq!(ledger.get_balance("c1").await?, 470);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::error::{BillingError, Result};
use super::storage::{BalanceGuard, BillingStore, TransactionFilter};
use super::usage::{Usage, UsageType};

/// Account receiving the offsetting leg of every customer movement.
pub const PLATFORM_ACCOUNT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Source recorded when the caller does not name one.
pub const DEFAULT_SOURCE: &str = "system";

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Debit,
    Credit,
}

/// One immutable leg of a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    /// Minor units, never negative.
    pub amount: i64,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub source: String,
    pub description: String,
    pub user_id: String,
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
}

impl Transaction {
    /// Signed effect on the account balance.
    #[must_use]
    pub fn signed_amount(&self) -> i64 {
        match self.tx_type {
            TransactionType::Credit => self.amount,
            TransactionType::Debit => -self.amount,
        }
    }
}

/// A request to add credits to a customer account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    /// Idempotency key; becomes the customer leg's transaction id.
    pub id: String,
    pub customer_id: String,
    pub amount: i64,
    pub source: String,
    pub description: String,
    pub user_id: String,
    pub metadata: HashMap<String, String>,
}

impl Credit {
    #[must_use]
    pub fn new(id: impl Into<String>, customer_id: impl Into<String>, amount: i64) -> Self {
        Self {
            id: id.into(),
            customer_id: customer_id.into(),
            amount,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Append-only credit ledger over a [`BillingStore`].
#[derive(Clone)]
pub struct Ledger<S: BillingStore> {
    store: S,
    audit: Arc<dyn BillingAuditLogger>,
}

impl<S: BillingStore> Ledger<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            audit: Arc::new(NoOpAuditLogger),
        }
    }

    /// Set the audit logger for credit movements.
    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Credit a customer account.
    ///
    /// Returns `BillingError::AlreadyApplied` when `credit.id` was seen
    /// before; the balance is unchanged in that case.
    pub async fn add(&self, credit: Credit) -> Result<()> {
        if credit.id.is_empty() {
            return Err(BillingError::invalid_detail("credit id is required"));
        }
        if credit.amount < 0 {
            return Err(BillingError::invalid_detail("credit amount cannot be negative"));
        }
        self.ensure_unapplied(&credit.id).await?;

        let source = non_empty_or(credit.source, DEFAULT_SOURCE);
        let now = super::current_timestamp();
        let template = Transaction {
            amount: credit.amount,
            source: source.clone(),
            description: credit.description,
            user_id: credit.user_id,
            metadata: credit.metadata,
            created_at: now,
            ..Transaction::default()
        };
        let debit = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: PLATFORM_ACCOUNT_ID.to_string(),
            tx_type: TransactionType::Debit,
            ..template.clone()
        };
        let credit_leg = Transaction {
            id: credit.id.clone(),
            account_id: credit.customer_id.clone(),
            tx_type: TransactionType::Credit,
            ..template
        };
        self.store.create_entry(debit, credit_leg, None).await?;

        tracing::debug!(
            target: "tideway::billing::ledger",
            transaction_id = %credit.id,
            account_id = %credit.customer_id,
            amount = credit.amount,
            "Credits added"
        );
        if credit.customer_id != PLATFORM_ACCOUNT_ID {
            self.audit
                .log(BillingAuditEvent::CreditAdded {
                    account_id: credit.customer_id,
                    transaction_id: credit.id,
                    amount: credit.amount,
                    source,
                })
                .await;
        }
        Ok(())
    }

    /// Deduct a credit usage from the customer's balance.
    ///
    /// Fails with `BillingError::NotEnough` without writing when the balance
    /// minus the customer's overdraft floor cannot cover the amount.
    pub async fn deduct(&self, usage: Usage) -> Result<()> {
        if usage.usage_type != UsageType::Credit {
            return Err(BillingError::invalid_detail(format!(
                "usage type '{}' cannot be deducted from credits",
                usage.usage_type
            )));
        }
        if usage.id.is_empty() {
            return Err(BillingError::invalid_detail("usage id is required"));
        }
        if usage.amount < 0 {
            return Err(BillingError::invalid_detail("usage amount cannot be negative"));
        }
        self.ensure_unapplied(&usage.id).await?;

        let customer = self.store.get_customer(&usage.customer_id).await?;
        let guard = BalanceGuard {
            account_id: customer.id.clone(),
            credit_min: customer.credit_min,
        };
        let balance = self.store.get_balance(&customer.id).await?;
        if !guard.allows(balance, usage.amount) {
            return Err(BillingError::NotEnough {
                account_id: customer.id,
                requested: usage.amount,
                available: balance - guard.credit_min,
            });
        }

        let source = non_empty_or(usage.source, DEFAULT_SOURCE);
        let template = Transaction {
            amount: usage.amount,
            source: source.clone(),
            description: usage.description,
            user_id: usage.user_id,
            metadata: usage.metadata,
            created_at: super::current_timestamp(),
            ..Transaction::default()
        };
        let debit = Transaction {
            id: usage.id.clone(),
            account_id: customer.id.clone(),
            tx_type: TransactionType::Debit,
            ..template.clone()
        };
        let credit_leg = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: PLATFORM_ACCOUNT_ID.to_string(),
            tx_type: TransactionType::Credit,
            ..template
        };
        // The store re-checks the guard atomically with the insert.
        self.store.create_entry(debit, credit_leg, Some(guard)).await?;

        tracing::debug!(
            target: "tideway::billing::ledger",
            transaction_id = %usage.id,
            account_id = %customer.id,
            amount = usage.amount,
            "Credits deducted"
        );
        self.audit
            .log(BillingAuditEvent::CreditDeducted {
                account_id: customer.id,
                transaction_id: usage.id,
                amount: usage.amount,
                source,
            })
            .await;
        Ok(())
    }

    /// Fails with `BillingError::AlreadyApplied` when `id` is stored; other
    /// lookup failures propagate.
    async fn ensure_unapplied(&self, id: &str) -> Result<()> {
        match self.store.get_transaction(id).await {
            Ok(_) => Err(BillingError::AlreadyApplied { id: id.to_string() }),
            Err(BillingError::TransactionNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get_balance(&self, account_id: &str) -> Result<i64> {
        self.store.get_balance(account_id).await
    }

    /// Balance movement in `[start, end)`.
    pub async fn get_balance_for_range(&self, account_id: &str, start: u64, end: u64) -> Result<i64> {
        self.store.get_balance_for_range(account_id, start, end).await
    }

    pub async fn get_total_debited_amount(&self, account_id: &str) -> Result<i64> {
        self.store.get_total_debited_amount(account_id).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Transaction> {
        self.store.get_transaction(id).await
    }

    pub async fn list(&self, filter: TransactionFilter) -> Result<Vec<Transaction>> {
        self.store.list_transactions(filter).await
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() { default.to_string() } else { value }
}
