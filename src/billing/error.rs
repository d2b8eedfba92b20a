//! Billing-specific error types.
//!
//! Every billing operation returns [`BillingError`] so callers can branch on
//! the exact failure (insufficient credits, already applied, seat limit...).
//! It converts into [`TidewayError`](crate::error::TidewayError) at the HTTP
//! boundary.

use std::fmt;

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Not-found errors
    /// Billing customer does not exist.
    CustomerNotFound { id: String },
    /// Checkout does not exist.
    CheckoutNotFound { id: String },
    /// Subscription does not exist.
    SubscriptionNotFound { id: String },
    /// Ledger transaction does not exist.
    TransactionNotFound { id: String },
    /// Invoice does not exist.
    InvoiceNotFound { id: String },
    /// Plan does not exist.
    PlanNotFound { id: String },
    /// Product does not exist.
    ProductNotFound { id: String },
    /// Feature does not exist.
    FeatureNotFound { id: String },

    // Validation errors
    /// Request is missing or carries invalid details.
    InvalidDetail { message: String },
    /// Identifier is malformed.
    InvalidId { id: String, reason: String },
    /// Invalid redirect URL provided.
    InvalidRedirectUrl { url: String, reason: String },
    /// Redirect URL domain not in allowed list.
    RedirectDomainNotAllowed { domain: String },

    // Conflict / idempotency
    /// A transaction with this id was already applied.
    AlreadyApplied { id: String },
    /// The subscription is already on the requested plan.
    AlreadyOnSamePlan { plan_id: String },
    /// The customer already holds a live subscription to the plan.
    ActiveConflict { subscription_id: String, plan_id: String },

    // Insufficient resources
    /// The account balance cannot cover the deduction.
    NotEnough { account_id: String, requested: i64, available: i64 },
    /// Organization member count exceeds the plan's seat limit.
    PerSeatLimitReached { limit: i64, members: i64 },
    /// The subscription is not active.
    SubscriptionInactive { id: String },

    // Provider errors
    /// A payment provider call failed.
    Provider { operation: String, message: String },
    /// The provider no longer knows about a locally tracked subscription.
    SubscriptionOnProviderNotFound { provider_id: String },

    // Webhook errors
    /// Webhook came from a provider that is not configured.
    UnsupportedProvider { provider: String },
    /// No webhook signing secret is configured.
    MissingWebhookSecret,
    /// Webhook signature is invalid for every configured secret.
    InvalidWebhookSignature,
    /// Webhook timestamp is outside the tolerance window.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    // Aggregates
    /// Several independent items failed; each entry is `(item id, error)`.
    Batch { errors: Vec<(String, BillingError)> },
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomerNotFound { id } => write!(f, "Billing customer not found: {}", id),
            Self::CheckoutNotFound { id } => write!(f, "Checkout not found: {}", id),
            Self::SubscriptionNotFound { id } => write!(f, "Subscription not found: {}", id),
            Self::TransactionNotFound { id } => write!(f, "Transaction not found: {}", id),
            Self::InvoiceNotFound { id } => write!(f, "Invoice not found: {}", id),
            Self::PlanNotFound { id } => write!(f, "Plan not found: {}", id),
            Self::ProductNotFound { id } => write!(f, "Product not found: {}", id),
            Self::FeatureNotFound { id } => write!(f, "Feature not found: {}", id),
            Self::InvalidDetail { message } => write!(f, "Invalid detail: {}", message),
            Self::InvalidId { id, reason } => write!(f, "Invalid ID '{}': {}", id, reason),
            Self::InvalidRedirectUrl { url, reason } => {
                write!(f, "Invalid redirect URL '{}': {}", url, reason)
            }
            Self::RedirectDomainNotAllowed { domain } => {
                write!(f, "Redirect domain '{}' is not allowed", domain)
            }
            Self::AlreadyApplied { id } => {
                write!(f, "Transaction '{}' has already been applied", id)
            }
            Self::AlreadyOnSamePlan { plan_id } => {
                write!(f, "Subscription is already on plan '{}'", plan_id)
            }
            Self::ActiveConflict { subscription_id, plan_id } => write!(
                f,
                "Already subscribed to plan '{}' (subscription {})",
                plan_id, subscription_id
            ),
            Self::NotEnough { account_id, requested, available } => write!(
                f,
                "Insufficient credits in account '{}': requested {}, available {}",
                account_id, requested, available
            ),
            Self::PerSeatLimitReached { limit, members } => write!(
                f,
                "Member count {} exceeds allowed seat limit {} of the plan",
                members, limit
            ),
            Self::SubscriptionInactive { id } => {
                write!(f, "Subscription '{}' is not active", id)
            }
            Self::Provider { operation, message } => {
                write!(f, "Failed to {} at billing provider: {}", operation, message)
            }
            Self::SubscriptionOnProviderNotFound { provider_id } => {
                write!(f, "Subscription '{}' not found at billing provider", provider_id)
            }
            Self::UnsupportedProvider { provider } => {
                write!(f, "Billing provider '{}' is not supported", provider)
            }
            Self::MissingWebhookSecret => write!(f, "No webhook secrets configured"),
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::Batch { errors } => {
                write!(f, "{} item(s) failed", errors.len())?;
                for (id, err) in errors {
                    write!(f, "\n{}: {}", id, err)?;
                }
                Ok(())
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::TidewayError {
    fn from(err: BillingError) -> Self {
        use crate::error::TidewayError;

        match &err {
            BillingError::CustomerNotFound { .. }
            | BillingError::CheckoutNotFound { .. }
            | BillingError::SubscriptionNotFound { .. }
            | BillingError::TransactionNotFound { .. }
            | BillingError::InvoiceNotFound { .. }
            | BillingError::PlanNotFound { .. }
            | BillingError::ProductNotFound { .. }
            | BillingError::FeatureNotFound { .. } => TidewayError::NotFound(err.to_string()),

            BillingError::SubscriptionInactive { .. }
            | BillingError::NotEnough { .. }
            | BillingError::PerSeatLimitReached { .. } => TidewayError::Forbidden(err.to_string()),

            BillingError::AlreadyApplied { .. }
            | BillingError::AlreadyOnSamePlan { .. }
            | BillingError::ActiveConflict { .. } => TidewayError::Conflict(err.to_string()),

            BillingError::InvalidDetail { .. }
            | BillingError::InvalidId { .. }
            | BillingError::InvalidRedirectUrl { .. }
            | BillingError::RedirectDomainNotAllowed { .. }
            | BillingError::UnsupportedProvider { .. }
            | BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. }
            | BillingError::Batch { .. } => TidewayError::BadRequest(err.to_string()),

            BillingError::Provider { .. } | BillingError::SubscriptionOnProviderNotFound { .. } => {
                TidewayError::ServiceUnavailable(err.to_string())
            }

            BillingError::MissingWebhookSecret | BillingError::Internal { .. } => {
                TidewayError::Internal(err.to_string())
            }
        }
    }
}

impl BillingError {
    /// Wrap a provider failure with the operation that was attempted.
    pub fn provider(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Shorthand for [`BillingError::InvalidDetail`].
    pub fn invalid_detail(message: impl Into<String>) -> Self {
        Self::InvalidDetail {
            message: message.into(),
        }
    }

    /// Shorthand for [`BillingError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::CustomerNotFound { .. }
                | Self::CheckoutNotFound { .. }
                | Self::SubscriptionNotFound { .. }
                | Self::TransactionNotFound { .. }
                | Self::InvoiceNotFound { .. }
                | Self::PlanNotFound { .. }
                | Self::ProductNotFound { .. }
                | Self::FeatureNotFound { .. }
        )
    }

    /// Check if the error signals an intentionally skipped no-op.
    ///
    /// Callers should treat these as success, not retry them.
    #[must_use]
    pub fn is_success_equivalent(&self) -> bool {
        matches!(
            self,
            Self::AlreadyApplied { .. } | Self::AlreadyOnSamePlan { .. } | Self::ActiveConflict { .. }
        )
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. }
                | Self::SubscriptionOnProviderNotFound { .. }
                | Self::MissingWebhookSecret
                | Self::Internal { .. }
        )
    }

    /// Check if retrying the same call may succeed.
    ///
    /// Only provider failures are retryable; the next sync cycle or webhook
    /// redelivery is the usual retry mechanism.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }

    /// Join per-item failures into one error.
    ///
    /// Returns `Ok(())` when there were no failures and the single error
    /// unchanged when there was exactly one.
    pub fn join(mut errors: Vec<(String, BillingError)>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => {
                let (_, err) = errors.remove(0);
                Err(err)
            }
            _ => Err(Self::Batch { errors }),
        }
    }

    /// Ids of the failed items when this is a batch error.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<&str> {
        match self {
            Self::Batch { errors } => errors.iter().map(|(id, _)| id.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}
