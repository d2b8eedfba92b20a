//! Webhook building blocks.
//!
//! Signature verification for provider deliveries and the single-flight
//! registry that collapses concurrent handling of the same event.

pub mod singleflight;
pub mod verification;

pub use singleflight::SingleFlight;
pub use verification::{SignatureHeader, WebhookVerifier, sign_payload};
