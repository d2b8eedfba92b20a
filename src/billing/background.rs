//! Periodic reconciliation with the payment provider.
//!
//! Webhooks can be lost and debounced reads only cover customers that are
//! looking at their billing pages. [`BackgroundSync`] walks every active
//! customer on a fixed interval and runs checkout, subscription and invoice
//! sync for each, sleeping a random jitter before each customer to spread the
//! load. After the walk it reconciles paid overdraft invoices and, on the
//! configured day of the month, raises new ones.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::checkout::CheckoutEngine;
use super::client::PaymentProviderClient;
use super::customer::CustomerState;
use super::debounce::spawn_detached;
use super::directory::Directory;
use super::error::Result;
use super::invoice::InvoiceEngine;
use super::storage::{BillingStore, CustomerFilter};
use super::subscription::SubscriptionEngine;
use crate::config::BillingConfig;

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Interval-driven reconciliation of all active customers.
#[derive(Clone)]
pub struct BackgroundSync<S: BillingStore, D: Directory, C: PaymentProviderClient> {
    store: S,
    checkouts: CheckoutEngine<S, D, C>,
    subscriptions: SubscriptionEngine<S, D, C>,
    invoices: InvoiceEngine<S, D, C>,
    interval: Duration,
    max_jitter: Duration,
    running: Arc<Mutex<Option<Running>>>,
}

impl<S: BillingStore, D: Directory, C: PaymentProviderClient> BackgroundSync<S, D, C> {
    #[must_use]
    pub fn new(
        store: S,
        checkouts: CheckoutEngine<S, D, C>,
        subscriptions: SubscriptionEngine<S, D, C>,
        invoices: InvoiceEngine<S, D, C>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            checkouts,
            subscriptions,
            invoices,
            interval: config.background_sync_interval(),
            max_jitter: Duration::from_millis(config.background_sync_jitter_ms),
            running: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start the loop. Calling `init` while it is running does nothing.
    pub fn init(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let this = self.clone();
        let handle = spawn_detached("background_sync", async move {
            let mut ticker = tokio::time::interval(this.interval);
            tracing::info!(
                target: "tideway::billing::background",
                interval_ms = this.interval.as_millis() as u64,
                "Background sync started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }
                let mut pass_stopped = stopped.clone();
                if let Err(e) = this.sync_all_with_stop(&mut pass_stopped).await {
                    tracing::error!(
                        target: "tideway::billing::background",
                        error = %e,
                        "Failed to list customers for background sync"
                    );
                }
            }
            tracing::info!(target: "tideway::billing::background", "Background sync stopped");
        });
        *running = Some(Running { stop, handle });
    }

    /// Stop the loop and wait for the current pass to wind down.
    pub async fn close(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.stop.send(true);
            if let Err(e) = running.handle.await {
                tracing::error!(
                    target: "tideway::billing::background",
                    error = %e,
                    "Background sync task panicked"
                );
            }
        }
    }

    /// Run one reconciliation pass over every active customer.
    ///
    /// Per-customer failures are logged; only failing to list customers is
    /// returned. Returns the number of customers visited.
    pub async fn sync_all(&self) -> Result<usize> {
        let (_stop, mut stopped) = watch::channel(false);
        self.sync_all_with_stop(&mut stopped).await
    }

    async fn sync_all_with_stop(&self, stopped: &mut watch::Receiver<bool>) -> Result<usize> {
        let customers = self
            .store
            .list_customers(CustomerFilter {
                state: Some(CustomerState::Active),
                ..CustomerFilter::default()
            })
            .await?;

        let mut visited = 0;
        for customer in customers.iter().filter(|c| !c.provider_id.is_empty()) {
            let jitter = random_jitter(self.max_jitter);
            if !jitter.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(jitter) => {}
                    _ = stopped.changed() => return Ok(visited),
                }
            }
            if *stopped.borrow() {
                return Ok(visited);
            }

            if let Err(e) = self.checkouts.sync_with_provider(&customer.id).await {
                tracing::warn!(
                    target: "tideway::billing::background",
                    customer_id = %customer.id,
                    error = %e,
                    "Checkout background sync failed"
                );
            }
            if let Err(e) = self.subscriptions.sync_with_provider(customer).await {
                tracing::warn!(
                    target: "tideway::billing::background",
                    customer_id = %customer.id,
                    error = %e,
                    "Subscription background sync failed"
                );
            }
            if let Err(e) = self.invoices.sync_with_provider(customer).await {
                tracing::warn!(
                    target: "tideway::billing::background",
                    customer_id = %customer.id,
                    error = %e,
                    "Invoice background sync failed"
                );
            }
            visited += 1;
        }

        self.settle_overdrafts().await;

        tracing::debug!(
            target: "tideway::billing::background",
            customers = visited,
            "Background sync pass finished"
        );
        Ok(visited)
    }

    /// Reconcile paid overdraft invoices, then raise new ones on invoice day.
    async fn settle_overdrafts(&self) {
        if let Err(e) = self.invoices.reconcile().await {
            tracing::warn!(
                target: "tideway::billing::background",
                error = %e,
                "Invoice reconciliation failed"
            );
        }
        if !self
            .invoices
            .is_overdraft_invoice_day(super::current_timestamp())
        {
            return;
        }
        match self.invoices.generate_for_credits().await {
            Ok(0) => {}
            Ok(created) => tracing::info!(
                target: "tideway::billing::background",
                invoices = created,
                "Credit overdraft invoices created"
            ),
            Err(e) => tracing::warn!(
                target: "tideway::billing::background",
                error = %e,
                "Credit overdraft invoicing failed"
            ),
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::checkout::{Checkout, CheckoutState};
    use crate::billing::client::test::MockProviderClient;
    use crate::billing::client::ProviderInvoice;
    use crate::billing::customer::Customer;
    use crate::billing::directory::test::InMemoryDirectory;
    use crate::billing::invoice::InvoiceState;
    use crate::billing::ledger::Ledger;
    use crate::billing::plans::{Plan, Price, Product};
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::usage::Usage;

    type Syncer = BackgroundSync<InMemoryBillingStore, InMemoryDirectory, MockProviderClient>;

    struct Fixture {
        sync: Syncer,
        checkouts: CheckoutEngine<InMemoryBillingStore, InMemoryDirectory, MockProviderClient>,
        invoices: InvoiceEngine<InMemoryBillingStore, InMemoryDirectory, MockProviderClient>,
        store: InMemoryBillingStore,
        client: MockProviderClient,
        ledger: Ledger<InMemoryBillingStore>,
    }

    fn fixture() -> Fixture {
        fixture_with(BillingConfig::default())
    }

    fn fixture_with(config: BillingConfig) -> Fixture {
        let store = InMemoryBillingStore::new();
        let directory = InMemoryDirectory::new();
        let client = MockProviderClient::new();

        store.add_customer(
            Customer::new("cust_1", "org_1")
                .with_provider_id("cus_1")
                .with_credit_min(-500),
        );
        store.add_customer(Customer::new("cust_local", "org_2"));
        let mut gone = Customer::new("cust_gone", "org_3").with_provider_id("cus_gone");
        gone.state = CustomerState::Disabled;
        store.add_customer(gone);

        let plan = Plan::builder("basic")
            .product(
                Product::builder("basic_base")
                    .price(Price::licensed("price_basic", "month"))
                    .plans(["basic"])
                    .build(),
            )
            .build();
        client.register_plan(&plan);
        directory.add_plan(plan);
        directory.add_product(
            Product::builder("overdraft_credits")
                .credits(100)
                .price(Price {
                    amount: 500,
                    ..Price::licensed("price_overdraft", "")
                })
                .build(),
        );

        let ledger = Ledger::new(store.clone());
        let invoices = InvoiceEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            config.clone(),
        );
        let subscriptions = SubscriptionEngine::new(
            store.clone(),
            directory.clone(),
            client.clone(),
            ledger.clone(),
            config.clone(),
        );
        let checkouts = CheckoutEngine::new(
            store.clone(),
            directory,
            client.clone(),
            ledger.clone(),
            subscriptions.clone(),
            config.clone(),
        );
        let sync = BackgroundSync::new(
            store.clone(),
            checkouts.clone(),
            subscriptions,
            invoices.clone(),
            &config,
        )
        .with_max_jitter(Duration::ZERO);
        Fixture {
            sync,
            checkouts,
            invoices,
            store,
            client,
            ledger,
        }
    }

    async fn completed_checkout(f: &Fixture) -> Checkout {
        let created = f
            .checkouts
            .create(
                Checkout::for_plan("cust_1", "basic")
                    .with_urls("https://app.example.com/done", "https://app.example.com/cancel"),
            )
            .await
            .unwrap();
        f.client.complete_session(&created.provider_id);
        created
    }

    #[test]
    fn test_random_jitter_bounds() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(random_jitter(Duration::from_millis(10)) <= Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_sync_all_visits_active_provider_customers() {
        let f = fixture();
        let created = completed_checkout(&f).await;

        assert_eq!(f.sync.sync_all().await.unwrap(), 1);

        let checkout = f.checkouts.get_by_id(&created.id).await.unwrap();
        assert_eq!(checkout.state, CheckoutState::Complete);
        assert_eq!(f.store.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_all_tolerates_provider_failures() {
        let f = fixture();
        completed_checkout(&f).await;
        f.client.fail_requests(true);

        assert_eq!(f.sync.sync_all().await.unwrap(), 1);
        assert!(f.store.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_sync_all_mirrors_invoices() {
        let f = fixture();
        f.client.insert_invoice(ProviderInvoice {
            id: "in_1".to_string(),
            customer_provider_id: "cus_1".to_string(),
            status: "open".to_string(),
            total: 900,
            created: 1_700_000_000,
            ..ProviderInvoice::default()
        });

        f.sync.sync_all().await.unwrap();
        let invoices = f.store.invoices();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].customer_id, "cust_1");
        assert_eq!(invoices[0].state, InvoiceState::Open);
    }

    #[tokio::test]
    async fn test_sync_all_reconciles_paid_overdraft() {
        let mut config = BillingConfig::default();
        config.account.credit_overdraft_product = "overdraft_credits".to_string();
        config.account.credit_overdraft_invoice_range_shift = 1;
        let f = fixture_with(config);

        f.ledger.deduct(Usage::credit("u1", "cust_1", 40)).await.unwrap();
        assert_eq!(f.invoices.generate_for_credits().await.unwrap(), 1);
        let invoice = f.store.invoices()[0].clone();
        f.client.set_invoice_status(&invoice.provider_id, "paid");

        f.sync.sync_all().await.unwrap();
        assert_eq!(f.store.invoices()[0].state, InvoiceState::Paid);
        assert!(f.store.invoices()[0].is_reconciled());
        assert_eq!(f.ledger.get_balance("cust_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_init_and_close() {
        let f = fixture();
        let sync = f.sync.clone().with_interval(Duration::from_millis(20));
        completed_checkout(&f).await;

        sync.init();
        sync.init();
        assert!(sync.is_running());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.store.subscriptions().len(), 1);

        sync.close().await;
        assert!(!sync.is_running());
    }
}
