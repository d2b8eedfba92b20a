//! Audit logging for billing operations.
//!
//! Every ledger movement on a customer account and every subscription
//! lifecycle change is reported as a [`BillingAuditEvent`]. Plug a
//! [`BillingAuditLogger`] into the engines to persist them.

use std::fmt;

use async_trait::async_trait;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Credits were added to a customer account.
    CreditAdded {
        account_id: String,
        transaction_id: String,
        amount: i64,
        source: String,
    },
    /// Credits were deducted from a customer account.
    CreditDeducted {
        account_id: String,
        transaction_id: String,
        amount: i64,
        source: String,
    },
    /// Checkout session created at the provider.
    CheckoutCreated {
        customer_id: String,
        checkout_id: String,
        session_id: String,
    },
    /// Checkout observed as complete and paid.
    CheckoutCompleted {
        customer_id: String,
        checkout_id: String,
    },
    /// Local subscription materialized.
    SubscriptionCreated {
        customer_id: String,
        subscription_id: String,
        plan_id: String,
    },
    /// Subscription canceled, now or at period end.
    SubscriptionCanceled {
        customer_id: String,
        subscription_id: String,
        immediate: bool,
    },
    /// Plan change scheduled.
    PlanChanged {
        customer_id: String,
        subscription_id: String,
        from_plan_id: String,
        to_plan_id: String,
        immediate: bool,
    },
    /// Seat quantity pushed to the provider.
    SeatQuantitySynced {
        customer_id: String,
        subscription_id: String,
        quantity: i64,
    },
    /// Invoice raised at the provider for credits used below zero.
    OverdraftInvoiced {
        customer_id: String,
        invoice_id: String,
        credits: i64,
    },
    /// Webhook accepted for dispatch.
    WebhookReceived {
        event_id: String,
        event_type: String,
    },
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreditAdded { account_id, transaction_id, amount, source } => write!(
                f,
                "Credit added: account={}, tx={}, amount={}, source={}",
                account_id, transaction_id, amount, source
            ),
            Self::CreditDeducted { account_id, transaction_id, amount, source } => write!(
                f,
                "Credit deducted: account={}, tx={}, amount={}, source={}",
                account_id, transaction_id, amount, source
            ),
            Self::CheckoutCreated { customer_id, checkout_id, session_id } => write!(
                f,
                "Checkout created: customer={}, checkout={}, session={}",
                customer_id, checkout_id, session_id
            ),
            Self::CheckoutCompleted { customer_id, checkout_id } => {
                write!(f, "Checkout completed: customer={}, checkout={}", customer_id, checkout_id)
            }
            Self::SubscriptionCreated { customer_id, subscription_id, plan_id } => write!(
                f,
                "Subscription created: customer={}, sub={}, plan={}",
                customer_id, subscription_id, plan_id
            ),
            Self::SubscriptionCanceled { customer_id, subscription_id, immediate } => write!(
                f,
                "Subscription canceled: customer={}, sub={}, immediate={}",
                customer_id, subscription_id, immediate
            ),
            Self::PlanChanged {
                customer_id,
                subscription_id,
                from_plan_id,
                to_plan_id,
                immediate,
            } => write!(
                f,
                "Plan changed: customer={}, sub={}, from={}, to={}, immediate={}",
                customer_id, subscription_id, from_plan_id, to_plan_id, immediate
            ),
            Self::SeatQuantitySynced { customer_id, subscription_id, quantity } => write!(
                f,
                "Seat quantity synced: customer={}, sub={}, quantity={}",
                customer_id, subscription_id, quantity
            ),
            Self::OverdraftInvoiced { customer_id, invoice_id, credits } => write!(
                f,
                "Overdraft invoiced: customer={}, invoice={}, credits={}",
                customer_id, invoice_id, credits
            ),
            Self::WebhookReceived { event_id, event_type } => {
                write!(f, "Webhook received: event={}, type={}", event_id, event_type)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations should handle their own failures (log and move on) so
/// auditing never disrupts a billing operation.
#[async_trait]
pub trait BillingAuditLogger: Send + Sync {
    async fn log(&self, event: BillingAuditEvent);
}

/// Audit logger that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

#[async_trait]
impl BillingAuditLogger for NoOpAuditLogger {
    async fn log(&self, _event: BillingAuditEvent) {}
}

/// Logs audit events through `tracing` at INFO level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

#[async_trait]
impl BillingAuditLogger for TracingAuditLogger {
    async fn log(&self, event: BillingAuditEvent) {
        tracing::info!(
            target: "billing::audit",
            event_type = %event_kind(&event),
            "{}", event
        );
    }
}

/// Get the event kind as a string for structured logging.
fn event_kind(event: &BillingAuditEvent) -> &'static str {
    match event {
        BillingAuditEvent::CreditAdded { .. } => "credit_added",
        BillingAuditEvent::CreditDeducted { .. } => "credit_deducted",
        BillingAuditEvent::CheckoutCreated { .. } => "checkout_created",
        BillingAuditEvent::CheckoutCompleted { .. } => "checkout_completed",
        BillingAuditEvent::SubscriptionCreated { .. } => "subscription_created",
        BillingAuditEvent::SubscriptionCanceled { .. } => "subscription_canceled",
        BillingAuditEvent::PlanChanged { .. } => "plan_changed",
        BillingAuditEvent::SeatQuantitySynced { .. } => "seat_quantity_synced",
        BillingAuditEvent::OverdraftInvoiced { .. } => "overdraft_invoiced",
        BillingAuditEvent::WebhookReceived { .. } => "webhook_received",
    }
}

#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Audit logger that captures events for assertions.
    #[derive(Default, Clone)]
    pub struct RecordingAuditLogger {
        events: Arc<Mutex<Vec<BillingAuditEvent>>>,
    }

    impl RecordingAuditLogger {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<BillingAuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BillingAuditLogger for RecordingAuditLogger {
        async fn log(&self, event: BillingAuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::RecordingAuditLogger;
    use super::*;

    #[tokio::test]
    async fn test_noop_logger() {
        NoOpAuditLogger
            .log(BillingAuditEvent::CheckoutCompleted {
                customer_id: "c1".to_string(),
                checkout_id: "co_1".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_recording_logger() {
        let logger = RecordingAuditLogger::new();

        logger
            .log(BillingAuditEvent::CreditAdded {
                account_id: "c1".to_string(),
                transaction_id: "tx1".to_string(),
                amount: 100,
                source: "system".to_string(),
            })
            .await;
        logger
            .log(BillingAuditEvent::SubscriptionCanceled {
                customer_id: "c1".to_string(),
                subscription_id: "sub_1".to_string(),
                immediate: false,
            })
            .await;

        let events = logger.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BillingAuditEvent::CreditAdded { amount: 100, .. }));
        assert!(matches!(events[1], BillingAuditEvent::SubscriptionCanceled { .. }));
    }

    #[test]
    fn test_event_display() {
        let event = BillingAuditEvent::PlanChanged {
            customer_id: "c1".to_string(),
            subscription_id: "sub_1".to_string(),
            from_plan_id: "basic".to_string(),
            to_plan_id: "pro".to_string(),
            immediate: true,
        };
        let display = event.to_string();
        assert!(display.contains("from=basic"));
        assert!(display.contains("to=pro"));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(
            event_kind(&BillingAuditEvent::SeatQuantitySynced {
                customer_id: String::new(),
                subscription_id: String::new(),
                quantity: 3,
            }),
            "seat_quantity_synced"
        );
    }
}
