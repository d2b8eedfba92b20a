//! Provider webhook dispatch.
//!
//! Verifies the delivery signature, decodes the event and hands the affected
//! entities to the matching reconciliation paths (checkout, subscription,
//! invoice or customer sync). Dispatch runs detached from the request; the caller gets
//! an answer as soon as the event is verified and routed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger};
use super::checkout::CheckoutEngine;
use super::client::PaymentProviderClient;
use super::customer::CustomerSyncer;
use super::debounce::spawn_detached;
use super::directory::Directory;
use super::error::{BillingError, Result};
use super::invoice::InvoiceEngine;
use super::storage::BillingStore;
use super::subscription::SubscriptionEngine;
use crate::config::WebhookConfig;
use crate::webhooks::{SingleFlight, WebhookVerifier};

/// Webhook event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

/// Result of accepting a webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Handed to a reconciliation path.
    Dispatched,
    /// Event type not handled, or no entity to reconcile.
    Ignored,
}

/// Something a webhook can ask to reconcile by provider id.
#[async_trait]
pub trait ProviderSync: Send + Sync {
    async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()>;
}

#[async_trait]
impl<S: BillingStore, D: Directory, C: PaymentProviderClient> ProviderSync for CheckoutEngine<S, D, C> {
    async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        CheckoutEngine::trigger_sync_by_provider_id(self, provider_id).await
    }
}

#[async_trait]
impl<S: BillingStore, D: Directory, C: PaymentProviderClient> ProviderSync
    for SubscriptionEngine<S, D, C>
{
    async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        SubscriptionEngine::trigger_sync_by_provider_id(self, provider_id).await
    }
}

#[async_trait]
impl<S: BillingStore, D: Directory, C: PaymentProviderClient> ProviderSync for InvoiceEngine<S, D, C> {
    async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        InvoiceEngine::trigger_sync_by_provider_id(self, provider_id).await
    }
}

#[async_trait]
impl<S: BillingStore, C: PaymentProviderClient> ProviderSync for CustomerSyncer<S, C> {
    async fn trigger_sync_by_provider_id(&self, provider_id: &str) -> Result<()> {
        CustomerSyncer::trigger_sync_by_provider_id(self, provider_id).await
    }
}

/// Reconciliation path an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookRoute {
    Checkout,
    Customer,
    Subscription,
    Invoice,
}

impl WebhookRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Customer => "customer",
            Self::Subscription => "subscription",
            Self::Invoice => "invoice",
        }
    }
}

/// Pick the routes and provider object ids to reconcile for an event.
///
/// Invoice events reconcile the invoice and, when it bills one, its
/// subscription. Empty for events nobody handles or that carry no usable id.
pub fn route_event(event: &WebhookEvent) -> Vec<(WebhookRoute, String)> {
    let object = &event.data.object;
    let field = |name: &str| {
        object
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let routes = match event.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            vec![field("id").map(|id| (WebhookRoute::Checkout, id))]
        }
        "customer.created" | "customer.updated" => {
            vec![field("id").map(|id| (WebhookRoute::Customer, id))]
        }
        "customer.source.created" | "customer.source.updated" => {
            vec![field("customer").map(|id| (WebhookRoute::Customer, id))]
        }
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.deleted" => {
            vec![field("id").map(|id| (WebhookRoute::Subscription, id))]
        }
        t if t.starts_with("invoice.") => vec![
            field("subscription").map(|id| (WebhookRoute::Subscription, id)),
            field("id").map(|id| (WebhookRoute::Invoice, id)),
        ],
        _ => Vec::new(),
    };
    routes.into_iter().flatten().collect()
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Entry point for provider webhook deliveries.
///
/// Concurrent deliveries for the same entity within the same second collapse
/// into one reconciliation.
#[derive(Clone)]
pub struct WebhookDispatcher {
    verifier: Arc<WebhookVerifier>,
    supported_providers: Vec<String>,
    checkouts: Arc<dyn ProviderSync>,
    subscriptions: Arc<dyn ProviderSync>,
    invoices: Arc<dyn ProviderSync>,
    customers: Arc<dyn ProviderSync>,
    flights: SingleFlight<()>,
    audit: Arc<dyn BillingAuditLogger>,
    clock: Clock,
}

impl WebhookDispatcher {
    pub fn new(
        config: &WebhookConfig,
        checkouts: impl ProviderSync + 'static,
        subscriptions: impl ProviderSync + 'static,
        invoices: impl ProviderSync + 'static,
        customers: impl ProviderSync + 'static,
    ) -> Self {
        Self {
            verifier: Arc::new(WebhookVerifier::from_config(config)),
            supported_providers: config
                .supported_providers
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            checkouts: Arc::new(checkouts),
            subscriptions: Arc::new(subscriptions),
            invoices: Arc::new(invoices),
            customers: Arc::new(customers),
            flights: SingleFlight::new(),
            audit: Arc::new(NoOpAuditLogger),
            clock: Arc::new(|| super::current_timestamp() as i64),
        }
    }

    #[must_use]
    pub fn with_audit_logger(mut self, logger: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Replace the clock used for signature age and dedup keys.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Verify, decode and dispatch one delivery.
    pub async fn billing_webhook(
        &self,
        raw_body: &[u8],
        signature_header: &str,
        provider_name: &str,
    ) -> Result<WebhookOutcome> {
        let provider = provider_name.to_lowercase();
        if !self.supported_providers.contains(&provider) {
            return Err(BillingError::UnsupportedProvider {
                provider: provider_name.to_string(),
            });
        }

        let now = (self.clock)();
        self.verifier.verify(raw_body, signature_header, now)?;

        // Detailed parse errors stay in the logs.
        let event: WebhookEvent = serde_json::from_slice(raw_body).map_err(|e| {
            tracing::warn!(
                target: "tideway::billing::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed JSON payload".to_string(),
            }
        })?;

        let routes = route_event(&event);
        if routes.is_empty() {
            tracing::debug!(
                target: "tideway::billing::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring webhook event"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        self.audit
            .log(BillingAuditEvent::WebhookReceived {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
            })
            .await;

        for (route, object_id) in routes {
            let key = format!("{}-{}-{}", route.as_str(), object_id, now);
            tracing::info!(
                target: "tideway::billing::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                route = route.as_str(),
                object_id = %object_id,
                "Dispatching webhook event"
            );

            let target = match route {
                WebhookRoute::Checkout => Arc::clone(&self.checkouts),
                WebhookRoute::Customer => Arc::clone(&self.customers),
                WebhookRoute::Subscription => Arc::clone(&self.subscriptions),
                WebhookRoute::Invoice => Arc::clone(&self.invoices),
            };
            let flights = self.flights.clone();
            spawn_detached("billing_webhook", async move {
                let sync_key = key.clone();
                flights
                    .run(&key, async move {
                        if let Err(e) = target.trigger_sync_by_provider_id(&object_id).await {
                            tracing::warn!(
                                target: "tideway::billing::webhook",
                                key = %sync_key,
                                error = %e,
                                "Webhook reconciliation failed"
                            );
                        }
                    })
                    .await;
            });
        }

        Ok(WebhookOutcome::Dispatched)
    }
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("verifier", &self.verifier)
            .field("supported_providers", &self.supported_providers)
            .field("in_flight", &self.flights.in_flight())
            .finish()
    }
}
