//! Webhook signature validation: hex HMAC-SHA-256 over the raw body,
//! compared in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify the `X-Webhook-Signature` value against the raw request body.
/// A missing header always fails when a secret is configured.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        tracing::warn!("missing webhook signature header");
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    let valid: bool = expected.as_bytes().ct_eq(signature.as_bytes()).into();
    if !valid {
        tracing::warn!("invalid webhook signature");
    }
    valid
}

/// Hex HMAC-SHA-256 of a body, for clients and tests.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_accepted() {
        let body = br#"{"event_type":"message.received"}"#;
        let signature = sign("secret", body);
        assert!(verify_signature("secret", body, Some(&signature)));
    }

    #[test]
    fn wrong_signature_rejected() {
        let body = b"payload";
        assert!(!verify_signature("secret", body, Some("deadbeef")));
    }

    #[test]
    fn missing_signature_rejected() {
        assert!(!verify_signature("secret", b"payload", None));
    }

    #[test]
    fn signature_is_body_sensitive() {
        let signature = sign("secret", b"payload");
        assert!(!verify_signature("secret", b"payload2", Some(&signature)));
    }

    #[test]
    fn signature_is_key_sensitive() {
        let signature = sign("secret", b"payload");
        assert!(!verify_signature("other", b"payload", Some(&signature)));
    }
}
