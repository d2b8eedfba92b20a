//! Provider webhook signature verification.
//!
//! Signatures follow the `t=<unix seconds>,v1=<hex hmac>` header scheme:
//! the HMAC-SHA256 of `"{t}.{body}"` keyed by the endpoint secret. Several
//! secrets can be configured at once so an endpoint keeps accepting
//! deliveries while its secret is rotated.
//!
//! ```rust,ignore
//! use tideway_billing::webhooks::WebhookVerifier;
//!
//! let verifier = WebhookVerifier::new(["whsec_new", "whsec_old"], 300);
//! verifier.verify(body, signature_header, now)?;
//! ```

use std::fmt;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::billing::error::{BillingError, Result};
use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme accepted in the header.
pub const SIGNATURE_SCHEME: &str = "v1";

/// Parsed signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Every `v1` signature in the header, hex encoded.
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse `t=..,v1=..[,v1=..]`. Unknown schemes are ignored.
    pub fn parse(header: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part
                .split_once('=')
                .ok_or(BillingError::InvalidWebhookSignature)?;
            match key.trim() {
                "t" => timestamp = value.trim().parse().ok(),
                SIGNATURE_SCHEME => signatures.push(value.trim().to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::InvalidWebhookSignature)?;
        if signatures.is_empty() {
            return Err(BillingError::InvalidWebhookSignature);
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}

/// Verifies webhook signatures against one or more secrets.
///
/// Secrets are held as [`SecretString`] and never printed.
pub struct WebhookVerifier {
    secrets: Vec<SecretString>,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    /// `tolerance_secs` of 0 disables the timestamp age check.
    pub fn new<I, T>(secrets: I, tolerance_secs: u64) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            secrets: secrets
                .into_iter()
                .map(|s| SecretString::from(s.into()))
                .collect(),
            tolerance_secs,
        }
    }

    #[must_use]
    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(config.secrets.iter().cloned(), config.tolerance_secs)
    }

    #[must_use]
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty()
    }

    /// Verify `header` for `payload` at time `now` (unix seconds).
    ///
    /// Each secret is tried in order; verification fails only when none of
    /// them produced a matching signature.
    pub fn verify(&self, payload: &[u8], header: &str, now: i64) -> Result<()> {
        if self.secrets.is_empty() {
            return Err(BillingError::MissingWebhookSecret);
        }
        let parsed = SignatureHeader::parse(header)?;
        let provided: Vec<Vec<u8>> = parsed
            .signatures
            .iter()
            .filter_map(|s| hex::decode(s).ok())
            .collect();

        for (idx, secret) in self.secrets.iter().enumerate() {
            let expected = compute_signature(secret.expose_secret(), parsed.timestamp, payload)?;
            if !provided.iter().any(|p| constant_time_compare(&expected, p)) {
                continue;
            }

            let age = now - parsed.timestamp;
            if self.tolerance_secs > 0 && age > self.tolerance_secs as i64 {
                return Err(BillingError::WebhookTimestampExpired { age_seconds: age });
            }
            if idx > 0 {
                tracing::debug!(
                    target: "tideway::billing::webhook",
                    secret_index = idx,
                    "Webhook verified with a secondary secret"
                );
            }
            return Ok(());
        }

        tracing::debug!(target: "tideway::billing::webhook", "Webhook signature verification failed");
        Err(BillingError::InvalidWebhookSignature)
    }
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secrets", &format!("[{} redacted]", self.secrets.len()))
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

/// Build a signature header for `payload`, as the provider would send it.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},{}={}", timestamp, SIGNATURE_SCHEME, hex::encode(signature)))
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::internal(format!("hmac key: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison; `subtle` keeps the compiler from reintroducing
/// data-dependent branches.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
