//! `X-Hub-Signature-256` verification (HMAC-SHA256 over the raw body).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Parses `sha256=<hex>` into raw bytes. `None` for anything malformed.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    hex::decode(header.strip_prefix("sha256=")?).ok()
}

pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Constant-time check of `signature_header` against `payload` signed with `secret`.
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

    #[test]
    fn known_vector() {
        // echo -n 'Hello, World!' | openssl dgst -sha256 -hmac "It's a Secret to Everybody"
        let header = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify_signature(
            b"Hello, World!",
            header,
            b"It's a Secret to Everybody"
        ));
    }

    #[test]
    fn roundtrip_and_tamper() {
        let header = format_signature_header(&compute_signature(b"{}", b"s3cret"));
        assert!(verify_signature(b"{}", &header, b"s3cret"));
        assert!(!verify_signature(b"{ }", &header, b"s3cret"));
        assert!(!verify_signature(b"{}", &header, b"other"));
    }

    #[test]
    fn malformed_headers_fail() {
        assert!(parse_signature_header("abcd").is_none());
        assert!(parse_signature_header("sha1=abcd").is_none());
        assert!(parse_signature_header("sha256=zz").is_none());
        assert!(!verify_signature(b"x", "sha256=", b"k"));
    }
}
