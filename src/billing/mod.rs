//! Multi-tenant billing core.
//!
//! A double-entry credit ledger, checkout, subscription and invoice engines
//! that reconcile local records with the payment provider, entitlement checks
//! and the webhook entry point. Storage, the plan catalog and the provider API are
//! traits; in-memory implementations live behind the `test-billing` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use tideway_billing::billing::{BillingService, Checkout, Usage};
//! use tideway_billing::config::BillingConfig;
//!
//! let billing = BillingService::new(store, directory, client, BillingConfig::default());
//!
//! // Hosted checkout for a plan; the id placeholder lands in the return URL.
//! let checkout = billing
//!     .checkouts
//!     .create(Checkout::for_plan("cust_1", "pro").with_urls(
//!         "https://app.example.com/billing/{{.CheckoutID}}",
//!         "https://app.example.com/billing",
//!     ))
//!     .await?;
//!
//! // Metered usage is paid for with credits.
//! billing.usage.report(vec![Usage::credit("req_42", "cust_1", 3)]).await?;
//!
//! if !billing.entitlements.check("cust_1", "api_access").await? {
//!     return Err(ApiError::UpgradeRequired);
//! }
//! ```

pub mod audit;
pub mod background;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod debounce;
pub mod directory;
pub mod entitlements;
pub mod error;
pub mod invoice;
pub mod ledger;
pub mod plans;
pub mod seats;
pub mod service;
pub mod storage;
pub mod subscription;
pub mod usage;
pub mod webhook;

/// Current unix time in seconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// Service
pub use service::{AWARDED_SOURCE, BillingService, onboard_credit_id};

// Ledger exports
pub use ledger::{Credit, Ledger, PLATFORM_ACCOUNT_ID, Transaction, TransactionType};
pub use usage::{Usage, UsageReporter, UsageType};

// Checkout exports
pub use checkout::{
    CHECKOUT_ID_PLACEHOLDER, Checkout, CheckoutEngine, CheckoutState, PaymentStatus,
    validate_redirect_url,
};

// Subscription exports
pub use subscription::{ChangeRequest, Phase, Subscription, SubscriptionEngine, SubscriptionState};

// Invoice exports
pub use invoice::{
    Invoice, InvoiceEngine, InvoiceItem, InvoiceItemType, InvoiceState, OverdraftPricing,
    overdraft_range_end, overdraft_transaction_id,
};

// Catalog and customers
pub use customer::{Customer, CustomerState, CustomerSyncer};
pub use directory::{Directory, OrganizationDirectory};
pub use plans::{Feature, Plan, PlanDirectory, Price, Product, ProductBehavior, ProductDirectory};
pub use seats::SeatChangeBehavior;

// Storage exports
pub use storage::{
    BillingStore, CheckoutFilter, CheckoutRepository, CustomerFilter, CustomerRepository,
    InvoiceFilter, InvoiceRepository, SubscriptionFilter, SubscriptionRepository,
    TransactionFilter, TransactionRepository,
};

// Provider exports
pub use client::{
    PaymentProviderClient, ProviderCheckoutClient, ProviderCustomerClient, ProviderInvoice,
    ProviderInvoiceClient, ProviderSubscriptionClient,
};

// Entitlements, sync and webhooks
pub use background::BackgroundSync;
pub use debounce::{SyncDebouncer, spawn_detached};
pub use entitlements::EntitlementChecker;
pub use webhook::{ProviderSync, WebhookDispatcher, WebhookEvent, WebhookOutcome, WebhookRoute};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Error exports
pub use error::{BillingError, Result};

// Test exports
#[cfg(any(test, feature = "test-billing"))]
pub use audit::test::RecordingAuditLogger;

#[cfg(any(test, feature = "test-billing"))]
pub use client::test::MockProviderClient;

#[cfg(any(test, feature = "test-billing"))]
pub use directory::test::InMemoryDirectory;

#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryBillingStore;
