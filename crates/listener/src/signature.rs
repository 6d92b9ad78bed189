//! GitHub webhook signature verification (HMAC-SHA256).
//!
//! GitHub signs each delivery body with the shared webhook secret and sends
//! the result in `X-Hub-Signature-256` as `sha256=<hex>`. Deliveries are
//! verified against the raw body before anything parses it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Decodes a `sha256=<hex>` header into raw signature bytes.
///
/// Returns `None` for any other algorithm prefix or invalid hex.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Produces the `X-Hub-Signature-256` value GitHub would send for `payload`.
///
/// Used by tests and by tooling that replays deliveries.
pub fn sign(payload: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Checks `signature_header` against `payload` in constant time.
///
/// Malformed headers verify as `false`; this never panics.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(signature_header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_lower_and_upper_case_hex() {
        assert_eq!(
            parse_signature_header("sha256=1234abcd"),
            Some(vec![0x12, 0x34, 0xab, 0xcd])
        );
        assert_eq!(
            parse_signature_header("sha256=ABCD1234"),
            Some(vec![0xab, 0xcd, 0x12, 0x34])
        );
    }

    #[test]
    fn rejects_other_algorithms_and_bad_hex() {
        assert_eq!(parse_signature_header("1234abcd"), None);
        assert_eq!(parse_signature_header("sha1=1234abcd"), None);
        assert_eq!(parse_signature_header("sha256=xyz"), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
        assert_eq!(parse_signature_header(""), None);
    }

    #[test]
    fn signed_payloads_verify() {
        let payload = br#"{"action":"opened"}"#;
        let header = sign(payload, b"It's a Secret to Everybody").unwrap();

        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert!(verify_signature(payload, &header, b"It's a Secret to Everybody"));
    }

    #[test]
    fn wrong_secret_or_modified_body_fails() {
        let header = sign(b"original", b"secret").unwrap();

        assert!(!verify_signature(b"original", &header, b"other"));
        assert!(!verify_signature(b"modified", &header, b"secret"));
    }

    #[test]
    fn malformed_headers_fail_closed() {
        for header in ["", "sha256=", "sha256=invalid", "sha1=abc123", "not-a-header"] {
            assert!(!verify_signature(b"test", header, b"secret"), "{header}");
        }
    }

    #[test]
    fn empty_secret_and_payload_still_sign() {
        let header = sign(b"", b"").unwrap();
        assert!(verify_signature(b"", &header, b""));
    }

    proptest! {
        #[test]
        fn verification_never_panics(payload in any::<Vec<u8>>(), header in ".*", secret in any::<Vec<u8>>()) {
            let _ = verify_signature(&payload, &header, &secret);
        }

        #[test]
        fn own_signatures_always_verify(payload in any::<Vec<u8>>(), secret in any::<Vec<u8>>()) {
            let header = sign(&payload, &secret).unwrap();
            prop_assert!(verify_signature(&payload, &header, &secret));
        }
    }
}
