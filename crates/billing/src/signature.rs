//! Webhook signature verification
//!
//! Gateways sign the raw request body with HMAC-SHA512 and send the digest in
//! a `sha512=<hex>` header. Comparison is constant-time; a plain `==` on the
//! hex strings would leak how many leading bytes matched.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha512 = Hmac<Sha512>;

const SIGNATURE_PREFIX: &str = "sha512=";

/// Verifies inbound webhook authenticity against a shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    /// Check `signature_header` against the HMAC-SHA512 of `body`.
    ///
    /// Fails closed: a missing secret is a configuration error, a missing or
    /// malformed header is a format rejection, and any digest mismatch
    /// (including wrong length) is a verification failure.
    pub fn verify(&self, body: &[u8], signature_header: Option<&str>) -> BillingResult<()> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(BillingError::Configuration("WEBHOOK_SECRET is not set"))?;

        let header = signature_header.ok_or(BillingError::SignatureFormat)?;
        let received_hex = header
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(BillingError::SignatureFormat)?;
        let received = hex::decode(received_hex).map_err(|_| BillingError::SignatureFormat)?;

        let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::Configuration("webhook secret unusable as HMAC key"))?;
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        // Explicit length check before the constant-time compare.
        if received.len() != expected.len() {
            return Err(BillingError::SignatureInvalid);
        }

        if expected.ct_eq(received.as_slice()).into() {
            Ok(())
        } else {
            Err(BillingError::SignatureInvalid)
        }
    }
}
