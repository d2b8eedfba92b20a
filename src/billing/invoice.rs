//! Provider invoices and credit overdraft billing.
//!
//! Invoices are created and collected by the provider; the local records are
//! copies kept current by [`InvoiceEngine::sync_with_provider`] from reads,
//! webhooks and the background loop.
//!
//! Customers with a negative `credit_min` may spend below zero. Once a month
//! [`InvoiceEngine::generate_for_credits`] bills the negative balance movement
//! since the last overdraft invoice, priced with the first price of the
//! configured credit product. When the provider reports the invoice paid,
//! [`InvoiceEngine::reconcile`] credits the same amount back to the ledger,
//! returning the account to where it was before the overdraft.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::client::{
    CreateInvoiceParams, InvoiceItemParams, PaymentProviderClient, ProviderInvoice,
    ProviderInvoiceLine,
};
use super::customer::{Customer, CustomerState};
use super::debounce::SyncDebouncer;
use super::directory::Directory;
use super::error::{BillingError, Result};
use super::ledger::{Credit, Ledger};
use super::plans::ProductBehavior;
use super::storage::{BillingStore, CustomerFilter, InvoiceFilter};
use crate::config::BillingConfig;

/// Line item metadata key holding the local item id.
pub const ITEM_ID_METADATA_KEY: &str = "item_id";

/// Line item metadata key holding the [`InvoiceItemType`].
pub const ITEM_TYPE_METADATA_KEY: &str = "item_type";

/// Invoice metadata key set once a paid invoice was credited to the ledger.
pub const RECONCILED_METADATA_KEY: &str = "reconciled";

/// Source recorded on credits granted for a paid overdraft invoice.
pub const OVERDRAFT_SOURCE: &str = "system.overdraft";

pub const CREDIT_OVERDRAFT_DESCRIPTION: &str = "Invoice for the underpayment of credit utilization";

const CREDIT_OVERDRAFT_ITEM_NAME: &str = "Credit Overdraft";

/// Provider invoice status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvoiceState {
    #[default]
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
    /// A status this crate does not know about, kept verbatim.
    Unrecognized(String),
}

impl InvoiceState {
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "draft" => Self::Draft,
            "open" => Self::Open,
            "paid" => Self::Paid,
            "void" => Self::Void,
            "uncollectible" => Self::Uncollectible,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Void => "void",
            Self::Uncollectible => "uncollectible",
            Self::Unrecognized(s) => s,
        }
    }
}

impl From<String> for InvoiceState {
    fn from(value: String) -> Self {
        Self::from_provider(&value)
    }
}

impl From<InvoiceState> for String {
    fn from(value: InvoiceState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an invoice line bills for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvoiceItemType {
    /// Credits spent below zero.
    Credit,
    /// Any other line, including ones the provider added.
    Other(String),
}

impl InvoiceItemType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Credit => "credit",
            Self::Other(s) => s,
        }
    }
}

impl Default for InvoiceItemType {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl From<String> for InvoiceItemType {
    fn from(value: String) -> Self {
        if value == "credit" { Self::Credit } else { Self::Other(value) }
    }
}

impl From<InvoiceItemType> for String {
    fn from(value: InvoiceItemType) -> Self {
        value.as_str().to_string()
    }
}

/// One line of an invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    /// Local id, carried through the provider in line metadata.
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub item_type: InvoiceItemType,
    /// Price per unit in the smallest currency unit.
    pub unit_amount: i64,
    pub quantity: i64,
    /// Billed period, unix seconds. Both set or both unset.
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
}

impl InvoiceItem {
    fn from_provider(line: &ProviderInvoiceLine) -> Self {
        Self {
            id: line.metadata.get(ITEM_ID_METADATA_KEY).cloned().unwrap_or_default(),
            provider_id: line.id.clone(),
            name: line.description.clone(),
            item_type: line
                .metadata
                .get(ITEM_TYPE_METADATA_KEY)
                .cloned()
                .map(InvoiceItemType::from)
                .unwrap_or_default(),
            unit_amount: line.unit_amount,
            quantity: line.quantity,
            range_start: line.period_start,
            range_end: line.period_end,
        }
    }

    #[must_use]
    pub fn is_credit(&self) -> bool {
        self.item_type == InvoiceItemType::Credit
    }
}

/// Local copy of a provider invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub provider_id: String,
    pub customer_id: String,
    pub state: InvoiceState,
    pub currency: String,
    /// Total in the smallest currency unit.
    pub amount: i64,
    pub hosted_url: String,
    pub metadata: HashMap<String, String>,
    pub items: Vec<InvoiceItem>,
    /// When the invoice was finalized.
    pub effective_at: Option<u64>,
    pub due_at: Option<u64>,
    pub period_start_at: u64,
    pub period_end_at: u64,
    pub created_at: u64,
}

impl Invoice {
    fn from_provider(customer_id: &str, remote: &ProviderInvoice) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider_id: remote.id.clone(),
            customer_id: customer_id.to_string(),
            state: InvoiceState::from_provider(&remote.status),
            currency: remote.currency.clone(),
            amount: remote.total,
            hosted_url: remote.hosted_url.clone(),
            metadata: remote.metadata.clone(),
            items: remote.lines.iter().map(InvoiceItem::from_provider).collect(),
            effective_at: remote.effective_at,
            due_at: remote.due_date.or(remote.next_payment_attempt),
            period_start_at: remote.period_start,
            period_end_at: remote.period_end,
            created_at: if remote.created == 0 {
                super::current_timestamp()
            } else {
                remote.created
            },
        }
    }

    /// Credits for this invoice were already added to the ledger.
    #[must_use]
    pub fn is_reconciled(&self) -> bool {
        self.metadata
            .get(RECONCILED_METADATA_KEY)
            .is_some_and(|v| v == "true")
    }
}

/// Deterministic transaction id for the credits of a paid overdraft item.
#[must_use]
pub fn overdraft_transaction_id(invoice_id: &str, item_id: &str) -> String {
    let key = format!("{}:{}", invoice_id, item_id);
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// End of the overdraft billing range for a run at `now`.
///
/// Midnight UTC on `day` of the current month, moved by `shift` months.
/// `None` when the date does not exist.
#[must_use]
pub fn overdraft_range_end(now: u64, day: u32, shift: i32) -> Option<u64> {
    let today = DateTime::from_timestamp(i64::try_from(now).ok()?, 0)?.date_naive();
    let end = NaiveDate::from_ymd_opt(today.year(), today.month(), day)?;
    let months = Months::new(shift.unsigned_abs());
    let end = if shift >= 0 {
        end.checked_add_months(months)?
    } else {
        end.checked_sub_months(months)?
    };
    u64::try_from(end.and_hms_opt(0, 0, 0)?.and_utc().timestamp()).ok()
}

/// Price of one overdraft credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverdraftPricing {
    pub unit_amount: i64,
    pub currency: String,
}

/// Invoice sync, overdraft invoicing and reconciliation.
#[derive(Clone)]
pub struct InvoiceEngine<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    store: S,
    directory: D,
    client: C,
    ledger: Ledger<S>,
    config: BillingConfig,
    audit: Arc<dyn BillingAuditLogger>,
    debouncer: SyncDebouncer,
    sync_lock: Arc<Mutex<()>>,
    generate_lock: Arc<Mutex<()>>,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> InvoiceEngine<S, D, C> {
    #[must_use]
    pub fn new(store: S, directory: D, client: C, ledger: Ledger<S>, config: BillingConfig) -> Self {
        let debouncer = SyncDebouncer::new(config.invoice_sync_delay());
        Self {
            store,
            directory,
            client,
            ledger,
            config,
            audit: Arc::new(NoOpAuditLogger),
            debouncer,
            sync_lock: Arc::new(Mutex::new(())),
            generate_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Set the audit logger for overdraft events.
    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Check the overdraft product configuration.
    ///
    /// Call once at startup so a misconfigured product fails fast instead of
    /// on the first invoicing run.
    pub async fn init(&self) -> Result<()> {
        if let Some(pricing) = self.overdraft_pricing().await? {
            tracing::info!(
                target: "tideway::billing::invoice",
                unit_amount = pricing.unit_amount,
                currency = %pricing.currency,
                "Credit overdraft invoicing enabled"
            );
        }
        Ok(())
    }

    /// Price of one overdraft credit, `None` when overdraft invoicing is off.
    pub async fn overdraft_pricing(&self) -> Result<Option<OverdraftPricing>> {
        let product_id = &self.config.account.credit_overdraft_product;
        if product_id.is_empty() {
            return Ok(None);
        }
        let product = self.directory.get_product(product_id).await?;
        if product.behavior != ProductBehavior::Credits {
            return Err(BillingError::invalid_detail(
                "credit overdraft product must have credit behavior",
            ));
        }
        let price = product.prices.first().ok_or_else(|| {
            BillingError::invalid_detail("credit overdraft product must have at least one price")
        })?;
        if price.currency.is_empty() {
            return Err(BillingError::invalid_detail(
                "credit overdraft product price must have a currency",
            ));
        }
        if product.config.credit_amount <= 0 {
            return Err(BillingError::invalid_detail(
                "credit overdraft product must grant credits",
            ));
        }
        Ok(Some(OverdraftPricing {
            unit_amount: price.amount / product.config.credit_amount,
            currency: price.currency.clone(),
        }))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Invoice> {
        self.store.get_invoice(id).await
    }

    /// List a customer's invoices and schedule a debounced provider sync.
    ///
    /// Fails with `BillingError::InvalidDetail` when no customer is named.
    pub async fn list(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>> {
        let Some(customer_id) = &filter.customer_id else {
            return Err(BillingError::invalid_detail("customer id is required"));
        };
        let customer = self.store.get_customer(customer_id).await?;
        let engine = self.clone();
        self.debouncer.call(move || async move {
            if let Err(e) = engine.sync_with_provider(&customer).await {
                tracing::error!(
                    target: "tideway::billing::invoice",
                    customer_id = %customer.id,
                    error = %e,
                    "Background invoice sync failed"
                );
            }
        });
        self.store.list_invoices(filter).await
    }

    /// List invoices across customers without triggering a sync.
    pub async fn list_all(&self, filter: InvoiceFilter) -> Result<Vec<Invoice>> {
        self.store.list_invoices(filter).await
    }

    /// Preview of the customer's next invoice.
    pub async fn get_upcoming(&self, customer_id: &str) -> Result<Option<Invoice>> {
        let customer = self.store.get_customer(customer_id).await?;
        if customer.provider_id.is_empty() {
            return Ok(None);
        }
        let upcoming = self.client.get_upcoming_invoice(&customer.provider_id).await?;
        Ok(upcoming.map(|remote| Invoice::from_provider(&customer.id, &remote)))
    }

    /// Copy the customer's provider invoices into the store.
    ///
    /// New invoices are created; known ones only take the provider's state,
    /// finalization time and hosted URL.
    pub async fn sync_with_provider(&self, customer: &Customer) -> Result<()> {
        if customer.provider_id.is_empty() {
            return Ok(());
        }
        let _guard = self.sync_lock.lock().await;

        let existing = self
            .store
            .list_invoices(InvoiceFilter {
                customer_id: Some(customer.id.clone()),
                ..InvoiceFilter::default()
            })
            .await?;
        let remote = self.client.list_invoices(&customer.provider_id).await?;

        let mut errors = Vec::new();
        for invoice in remote {
            let local = existing.iter().find(|i| i.provider_id == invoice.id).cloned();
            if let Err(e) = self.upsert(&customer.id, local, &invoice).await {
                tracing::warn!(
                    target: "tideway::billing::invoice",
                    invoice_provider_id = %invoice.id,
                    error = %e,
                    "Invoice sync failed"
                );
                errors.push((invoice.id, e));
            }
        }
        BillingError::join(errors)
    }

    /// Sync the customer owning a provider invoice (webhook path).
    pub async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        let remote = self.client.get_invoice(provider_id).await?;
        let customer = self
            .store
            .get_customer_by_provider_id(&remote.customer_provider_id)
            .await?;
        self.sync_with_provider(&customer).await
    }

    /// Create and finalize an invoice at the provider.
    ///
    /// The local copy arrives through the next sync.
    pub async fn create_in_provider(
        &self,
        customer: &Customer,
        description: &str,
        items: &[InvoiceItem],
        currency: &str,
    ) -> Result<ProviderInvoice> {
        for item in items {
            if item.unit_amount <= 0 || item.quantity <= 0 {
                return Err(BillingError::invalid_detail(
                    "unit amount and quantity must be greater than 0",
                ));
            }
            if item.range_start.is_some() != item.range_end.is_some() {
                return Err(BillingError::invalid_detail(
                    "both range start and end must be provided",
                ));
            }
            if item.id.is_empty() {
                return Err(BillingError::invalid_detail("item id is required"));
            }
        }

        let base_metadata = HashMap::from([
            ("org_id".to_string(), customer.org_id.clone()),
            ("managed_by".to_string(), self.config.managed_by.clone()),
        ]);
        let items = items
            .iter()
            .map(|item| {
                let mut metadata = base_metadata.clone();
                metadata.insert(ITEM_ID_METADATA_KEY.to_string(), item.id.clone());
                metadata.insert(
                    ITEM_TYPE_METADATA_KEY.to_string(),
                    item.item_type.as_str().to_string(),
                );
                InvoiceItemParams {
                    unit_amount: item.unit_amount,
                    quantity: item.quantity,
                    description: item.name.clone(),
                    metadata,
                    period: item.range_start.zip(item.range_end),
                }
            })
            .collect();
        let due_in_days = self.config.account.invoice_due_in_days;

        self.client
            .create_invoice(CreateInvoiceParams {
                customer_provider_id: customer.provider_id.clone(),
                currency: currency.to_string(),
                description: description.to_string(),
                days_until_due: (due_in_days > 0).then_some(due_in_days),
                auto_tax: self.config.auto_tax,
                metadata: base_metadata,
                items,
            })
            .await
    }

    /// Invoice every overdraft customer for credits spent below zero.
    ///
    /// Returns how many invoices were created. A run that finds another run
    /// in progress returns 0 without doing anything.
    pub async fn generate_for_credits(&self) -> Result<usize> {
        let Some(pricing) = self.overdraft_pricing().await? else {
            return Ok(0);
        };
        if pricing.unit_amount <= 0 {
            tracing::warn!(
                target: "tideway::billing::invoice",
                "Credit overdraft price rounds to zero per credit, skipping invoicing"
            );
            return Ok(0);
        }
        let Ok(_running) = self.generate_lock.try_lock() else {
            tracing::debug!(
                target: "tideway::billing::invoice",
                "Overdraft invoicing already running"
            );
            return Ok(0);
        };

        let account = &self.config.account;
        let end = overdraft_range_end(
            super::current_timestamp(),
            account.credit_overdraft_invoice_day,
            account.credit_overdraft_invoice_range_shift,
        )
        .ok_or_else(|| BillingError::internal("credit overdraft range end is not a valid date"))?;

        let customers = self
            .store
            .list_customers(CustomerFilter {
                state: Some(CustomerState::Active),
                ..CustomerFilter::default()
            })
            .await?;

        let mut created = 0;
        let mut errors = Vec::new();
        for customer in customers
            .iter()
            .filter(|c| c.credit_min < 0 && !c.provider_id.is_empty())
        {
            match self.invoice_overdraft(customer, &pricing, end).await {
                Ok(true) => created += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        target: "tideway::billing::invoice",
                        customer_id = %customer.id,
                        error = %e,
                        "Overdraft invoicing failed"
                    );
                    errors.push((customer.id.clone(), e));
                }
            }
        }
        BillingError::join(errors)?;
        Ok(created)
    }

    /// Bill the customer's negative balance movement up to `end`.
    ///
    /// The range starts where the last billed credit item ended, or at the
    /// customer's creation for the first invoice.
    async fn invoice_overdraft(
        &self,
        customer: &Customer,
        pricing: &OverdraftPricing,
        end: u64,
    ) -> Result<bool> {
        let invoices = self
            .store
            .list_invoices(InvoiceFilter {
                customer_id: Some(customer.id.clone()),
                ..InvoiceFilter::default()
            })
            .await?;
        let start = invoices
            .iter()
            .flat_map(|i| i.items.iter())
            .filter(|item| item.is_credit())
            .filter_map(|item| item.range_end)
            .fold(customer.created_at, u64::max);
        if end <= start {
            return Ok(false);
        }

        let balance = self
            .ledger
            .get_balance_for_range(&customer.id, start, end)
            .await?;
        if balance >= 0 {
            return Ok(false);
        }
        let credits = balance.saturating_neg();

        let item = InvoiceItem {
            id: uuid::Uuid::new_v4().to_string(),
            name: CREDIT_OVERDRAFT_ITEM_NAME.to_string(),
            item_type: InvoiceItemType::Credit,
            unit_amount: pricing.unit_amount,
            quantity: credits,
            range_start: Some(start),
            range_end: Some(end),
            ..InvoiceItem::default()
        };
        let remote = self
            .create_in_provider(customer, CREDIT_OVERDRAFT_DESCRIPTION, &[item], &pricing.currency)
            .await?;

        let invoice = {
            let _guard = self.sync_lock.lock().await;
            let existing = self
                .store
                .list_invoices(InvoiceFilter {
                    provider_id: Some(remote.id.clone()),
                    ..InvoiceFilter::default()
                })
                .await?
                .into_iter()
                .next();
            self.upsert(&customer.id, existing, &remote).await?
        };

        tracing::info!(
            target: "tideway::billing::invoice",
            customer_id = %customer.id,
            invoice_id = %invoice.id,
            credits,
            "Credit overdraft invoiced"
        );
        self.audit
            .log(BillingAuditEvent::OverdraftInvoiced {
                customer_id: customer.id.clone(),
                invoice_id: invoice.id,
                credits,
            })
            .await;
        Ok(true)
    }

    /// Credit the ledger for every paid overdraft invoice not yet reconciled.
    ///
    /// Returns how many invoices were marked reconciled.
    pub async fn reconcile(&self) -> Result<usize> {
        if self.config.account.credit_overdraft_product.is_empty() {
            return Ok(0);
        }
        let invoices = self
            .store
            .list_invoices(InvoiceFilter {
                state: Some(InvoiceState::Paid),
                non_zero_only: true,
                ..InvoiceFilter::default()
            })
            .await?;

        let mut reconciled = 0;
        let mut errors = Vec::new();
        for invoice in invoices.into_iter().filter(|i| !i.is_reconciled()) {
            let id = invoice.id.clone();
            match self.reconcile_invoice(invoice).await {
                Ok(()) => reconciled += 1,
                Err(e) => {
                    tracing::warn!(
                        target: "tideway::billing::invoice",
                        invoice_id = %id,
                        error = %e,
                        "Invoice reconciliation failed"
                    );
                    errors.push((id, e));
                }
            }
        }
        BillingError::join(errors)?;
        Ok(reconciled)
    }

    async fn reconcile_invoice(&self, mut invoice: Invoice) -> Result<()> {
        for item in invoice.items.iter().filter(|item| item.is_credit()) {
            if item.id.is_empty() {
                return Err(BillingError::invalid_detail(
                    "item id is required for credit reconciliation",
                ));
            }
            let mut credit = Credit::new(
                overdraft_transaction_id(&invoice.id, &item.id),
                invoice.customer_id.clone(),
                item.quantity,
            )
            .with_source(OVERDRAFT_SOURCE)
            .with_description("Paid for credit overdraft invoice");
            credit.metadata = HashMap::from([
                ("invoice_id".to_string(), invoice.id.clone()),
                ("item_provider_id".to_string(), item.provider_id.clone()),
                ("overdraft".to_string(), "true".to_string()),
            ]);
            match self.ledger.add(credit).await {
                Ok(()) | Err(BillingError::AlreadyApplied { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        invoice
            .metadata
            .insert(RECONCILED_METADATA_KEY.to_string(), "true".to_string());
        let invoice = self.store.update_invoice(invoice).await?;
        tracing::info!(
            target: "tideway::billing::invoice",
            invoice_id = %invoice.id,
            customer_id = %invoice.customer_id,
            "Invoice reconciled"
        );
        Ok(())
    }

    /// Whether `now` falls on the configured overdraft invoice day (UTC).
    #[must_use]
    pub fn is_overdraft_invoice_day(&self, now: u64) -> bool {
        i64::try_from(now)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .is_some_and(|t| t.day() == self.config.account.credit_overdraft_invoice_day)
    }

    /// Remove every local invoice of the customer.
    pub async fn delete_by_customer(&self, customer: &Customer) -> Result<()> {
        let invoices = self
            .list_all(InvoiceFilter {
                customer_id: Some(customer.id.clone()),
                ..InvoiceFilter::default()
            })
            .await?;
        for invoice in invoices {
            self.store.delete_invoice(&invoice.id).await?;
        }
        tracing::info!(
            target: "tideway::billing::invoice",
            customer_id = %customer.id,
            "Invoices deleted for customer"
        );
        Ok(())
    }

    async fn upsert(
        &self,
        customer_id: &str,
        existing: Option<Invoice>,
        remote: &ProviderInvoice,
    ) -> Result<Invoice> {
        let Some(mut invoice) = existing else {
            return self
                .store
                .create_invoice(Invoice::from_provider(customer_id, remote))
                .await;
        };

        let mut changed = false;
        let state = InvoiceState::from_provider(&remote.status);
        if invoice.state != state {
            invoice.state = state;
            changed = true;
        }
        if remote.effective_at.is_some() && invoice.effective_at != remote.effective_at {
            invoice.effective_at = remote.effective_at;
            changed = true;
        }
        if !remote.hosted_url.is_empty() && invoice.hosted_url != remote.hosted_url {
            invoice.hosted_url = remote.hosted_url.clone();
            changed = true;
        }
        if changed {
            self.store.update_invoice(invoice).await
        } else {
            Ok(invoice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::test::RecordingAuditLogger;
    use crate::billing::client::test::MockProviderClient;
    use crate::billing::directory::test::InMemoryDirectory;
    use crate::billing::plans::{Price, Product};
    use crate::billing::storage::InvoiceRepository;
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::usage::Usage;

    type Engine = InvoiceEngine<InMemoryBillingStore, InMemoryDirectory, MockProviderClient>;

    struct Fixture {
        engine: Engine,
        store: InMemoryBillingStore,
        client: MockProviderClient,
        ledger: Ledger<InMemoryBillingStore>,
        audit: RecordingAuditLogger,
    }

    fn overdraft_product() -> Product {
        Product::builder("overdraft_credits")
            .credits(100)
            .price(Price {
                amount: 1000,
                ..Price::licensed("price_overdraft", "")
            })
            .build()
    }

    fn customer() -> Customer {
        let mut customer = Customer::new("cust_1", "org_1")
            .with_provider_id("cus_1")
            .with_credit_min(-1000);
        customer.created_at -= 86_400;
        customer
    }

    fn overdraft_config() -> BillingConfig {
        let mut config = BillingConfig::default();
        config.account.credit_overdraft_product = "overdraft_credits".to_string();
        // Bill up to next month's invoice day so usage made now is in range.
        config.account.credit_overdraft_invoice_range_shift = 1;
        config
    }

    fn fixture_with(config: BillingConfig) -> Fixture {
        let store = InMemoryBillingStore::new();
        let directory = InMemoryDirectory::new();
        let client = MockProviderClient::new();
        let audit = RecordingAuditLogger::new();
        let ledger = Ledger::new(store.clone());

        store.add_customer(customer());
        directory.add_product(overdraft_product());

        let engine = InvoiceEngine::new(
            store.clone(),
            directory,
            client.clone(),
            ledger.clone(),
            config,
        )
        .with_audit_logger(Arc::new(audit.clone()));
        Fixture {
            engine,
            store,
            client,
            ledger,
            audit,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(overdraft_config())
    }

    fn utc(year: i32, month: u32, day: u32, hour: u32) -> u64 {
        let t = NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        t.and_utc().timestamp() as u64
    }

    fn remote_invoice(id: &str, status: &str) -> ProviderInvoice {
        ProviderInvoice {
            id: id.to_string(),
            customer_provider_id: "cus_1".to_string(),
            status: status.to_string(),
            currency: "usd".to_string(),
            total: 500,
            created: 1_700_000_000,
            ..ProviderInvoice::default()
        }
    }

    #[test]
    fn test_overdraft_range_end() {
        let now = utc(2024, 3, 15, 12);
        assert_eq!(overdraft_range_end(now, 1, 0), Some(utc(2024, 3, 1, 0)));
        assert_eq!(overdraft_range_end(now, 1, 1), Some(utc(2024, 4, 1, 0)));
        assert_eq!(overdraft_range_end(now, 5, -1), Some(utc(2024, 2, 5, 0)));
        assert_eq!(overdraft_range_end(utc(2024, 12, 20, 0), 1, 1), Some(utc(2025, 1, 1, 0)));
        assert_eq!(overdraft_range_end(utc(2024, 2, 10, 0), 30, 0), None);
    }

    #[test]
    fn test_item_type_from_metadata() {
        let line = ProviderInvoiceLine {
            id: "il_1".to_string(),
            metadata: HashMap::from([
                (ITEM_ID_METADATA_KEY.to_string(), "item_1".to_string()),
                (ITEM_TYPE_METADATA_KEY.to_string(), "credit".to_string()),
            ]),
            ..ProviderInvoiceLine::default()
        };
        let item = InvoiceItem::from_provider(&line);
        assert_eq!(item.id, "item_1");
        assert!(item.is_credit());

        let provider_line = InvoiceItem::from_provider(&ProviderInvoiceLine::default());
        assert!(!provider_line.is_credit());
        assert!(provider_line.id.is_empty());
    }

    #[tokio::test]
    async fn test_init_rejects_non_credit_product() {
        let mut config = BillingConfig::default();
        config.account.credit_overdraft_product = "seats".to_string();
        let f = fixture_with(config);
        let directory = InMemoryDirectory::new();
        directory.add_product(Product::builder("seats").per_seat(0).build());
        let engine = InvoiceEngine::new(
            f.store.clone(),
            directory,
            f.client.clone(),
            f.ledger.clone(),
            f.engine.config.clone(),
        );

        let err = engine.init().await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidDetail { .. }));
    }

    #[tokio::test]
    async fn test_overdraft_pricing_divides_pack_price() {
        let f = fixture();
        f.engine.init().await.unwrap();
        let pricing = f.engine.overdraft_pricing().await.unwrap().unwrap();
        assert_eq!(pricing.unit_amount, 10);
        assert_eq!(pricing.currency, "usd");

        let disabled = fixture_with(BillingConfig::default());
        assert!(disabled.engine.overdraft_pricing().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_creates_then_updates_invoice() {
        let f = fixture();
        f.client.insert_invoice(remote_invoice("in_remote", "open"));

        f.engine.sync_with_provider(&customer()).await.unwrap();
        let invoices = f.store.invoices();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].state, InvoiceState::Open);
        assert_eq!(invoices[0].customer_id, "cust_1");
        let local_id = invoices[0].id.clone();

        f.client.set_invoice_status("in_remote", "paid");
        let mut paid = f.client.invoice("in_remote").unwrap();
        paid.hosted_url = "https://pay.example.com/in_remote".to_string();
        f.client.insert_invoice(paid);

        f.engine.sync_with_provider(&customer()).await.unwrap();
        let invoices = f.store.invoices();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].id, local_id);
        assert_eq!(invoices[0].state, InvoiceState::Paid);
        assert_eq!(invoices[0].hosted_url, "https://pay.example.com/in_remote");
        assert!(invoices[0].effective_at.is_some());
    }

    #[tokio::test]
    async fn test_sync_provider_failure_propagates() {
        let f = fixture();
        f.client.fail_requests(true);
        let err = f.engine.sync_with_provider(&customer()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(f.store.invoices().is_empty());
    }

    #[tokio::test]
    async fn test_list_requires_customer_id() {
        let f = fixture();
        let err = f.engine.list(InvoiceFilter::default()).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidDetail { .. }));

        let invoices = f
            .engine
            .list(InvoiceFilter {
                customer_id: Some("cust_1".to_string()),
                ..InvoiceFilter::default()
            })
            .await
            .unwrap();
        assert!(invoices.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_sync_by_provider_id() {
        let f = fixture();
        f.client.insert_invoice(remote_invoice("in_hook", "open"));
        f.engine.trigger_sync_by_provider_id("in_hook").await.unwrap();
        assert_eq!(f.store.invoices().len(), 1);

        let mut orphan = remote_invoice("in_orphan", "open");
        orphan.customer_provider_id = "cus_unknown".to_string();
        f.client.insert_invoice(orphan);
        let err = f.engine.trigger_sync_by_provider_id("in_orphan").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_upcoming() {
        let f = fixture();
        assert!(f.engine.get_upcoming("cust_1").await.unwrap().is_none());

        f.client.set_upcoming_invoice("cus_1", remote_invoice("in_next", "draft"));
        let upcoming = f.engine.get_upcoming("cust_1").await.unwrap().unwrap();
        assert_eq!(upcoming.provider_id, "in_next");
        assert_eq!(upcoming.state, InvoiceState::Draft);
        assert!(f.store.invoices().is_empty());
    }

    #[tokio::test]
    async fn test_create_in_provider_validates_items() {
        let f = fixture();
        let valid = InvoiceItem {
            id: "item_1".to_string(),
            unit_amount: 10,
            quantity: 3,
            ..InvoiceItem::default()
        };

        let zero_quantity = InvoiceItem { quantity: 0, ..valid.clone() };
        let half_range = InvoiceItem {
            range_start: Some(100),
            ..valid.clone()
        };
        let no_id = InvoiceItem {
            id: String::new(),
            ..valid.clone()
        };
        for item in [zero_quantity, half_range, no_id] {
            let err = f
                .engine
                .create_in_provider(&customer(), "test", &[item], "usd")
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidDetail { .. }));
        }
        assert!(f.client.created_invoices().is_empty());

        let invoice = f
            .engine
            .create_in_provider(&customer(), "test", &[valid], "usd")
            .await
            .unwrap();
        assert_eq!(invoice.total, 30);
        let params = &f.client.created_invoices()[0];
        assert_eq!(params.items[0].metadata[ITEM_ID_METADATA_KEY], "item_1");
        assert_eq!(params.metadata["org_id"], "org_1");
    }

    #[tokio::test]
    async fn test_overdraft_invoiced_and_reconciled_once() {
        let f = fixture();
        f.ledger.deduct(Usage::credit("u1", "cust_1", 30)).await.unwrap();
        assert_eq!(f.ledger.get_balance("cust_1").await.unwrap(), -30);

        assert_eq!(f.engine.generate_for_credits().await.unwrap(), 1);
        let invoices = f.store.invoices();
        assert_eq!(invoices.len(), 1);
        let invoice = invoices[0].clone();
        assert_eq!(invoice.state, InvoiceState::Open);
        assert_eq!(invoice.amount, 300);
        assert_eq!(invoice.items[0].quantity, 30);
        assert!(invoice.items[0].is_credit());
        assert!(f.audit.events().iter().any(|e| matches!(
            e,
            BillingAuditEvent::OverdraftInvoiced { credits: 30, .. }
        )));

        // Unpaid invoices are not credited.
        assert_eq!(f.engine.reconcile().await.unwrap(), 0);

        f.client.set_invoice_status(&invoice.provider_id, "paid");
        f.engine.sync_with_provider(&customer()).await.unwrap();
        assert_eq!(f.engine.reconcile().await.unwrap(), 1);
        assert_eq!(f.ledger.get_balance("cust_1").await.unwrap(), 0);

        let tx_id = overdraft_transaction_id(&invoice.id, &invoice.items[0].id);
        let tx = f.ledger.get_by_id(&tx_id).await.unwrap();
        assert_eq!(tx.source, OVERDRAFT_SOURCE);
        assert_eq!(tx.amount, 30);
        assert!(f.store.invoices()[0].is_reconciled());

        assert_eq!(f.engine.reconcile().await.unwrap(), 0);
        assert_eq!(f.engine.generate_for_credits().await.unwrap(), 0);
        assert_eq!(f.client.created_invoices().len(), 1);
        assert_eq!(f.ledger.get_balance("cust_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_replay_does_not_double_credit() {
        let f = fixture();
        f.ledger.deduct(Usage::credit("u1", "cust_1", 20)).await.unwrap();
        f.engine.generate_for_credits().await.unwrap();
        let invoice = f.store.invoices()[0].clone();
        f.client.set_invoice_status(&invoice.provider_id, "paid");
        f.engine.sync_with_provider(&customer()).await.unwrap();
        f.engine.reconcile().await.unwrap();

        // Lose the reconciled marker so the invoice is processed again.
        let mut stale = f.store.invoices()[0].clone();
        stale.metadata.remove(RECONCILED_METADATA_KEY);
        f.engine.store.update_invoice(stale).await.unwrap();

        assert_eq!(f.engine.reconcile().await.unwrap(), 1);
        assert_eq!(f.ledger.get_balance("cust_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_generate_skips_customers_without_overdraft() {
        let f = fixture();
        f.store.add_customer(Customer::new("cust_2", "org_2").with_provider_id("cus_2"));
        f.ledger.add(Credit::new("grant", "cust_1", 10)).await.unwrap();

        assert_eq!(f.engine.generate_for_credits().await.unwrap(), 0);
        assert!(f.client.created_invoices().is_empty());

        let disabled = fixture_with(BillingConfig::default());
        disabled.ledger.deduct(Usage::credit("u1", "cust_1", 5)).await.unwrap();
        assert_eq!(disabled.engine.generate_for_credits().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_is_overdraft_invoice_day() {
        let f = fixture();
        assert!(f.engine.is_overdraft_invoice_day(utc(2024, 5, 1, 9)));
        assert!(!f.engine.is_overdraft_invoice_day(utc(2024, 5, 2, 9)));
    }

    #[tokio::test]
    async fn test_delete_by_customer() {
        let f = fixture();
        f.client.insert_invoice(remote_invoice("in_a", "open"));
        f.client.insert_invoice(remote_invoice("in_b", "paid"));
        f.engine.sync_with_provider(&customer()).await.unwrap();
        assert_eq!(f.store.invoices().len(), 2);

        f.engine.delete_by_customer(&customer()).await.unwrap();
        assert!(f.store.invoices().is_empty());
    }
}
