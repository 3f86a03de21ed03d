//! `Stripe-Signature` verification.
//!
//! The header carries a timestamp and one or more signatures:
//! `t=1700000000,v1=<hex>,v1=<hex>`. Each `v1` is the hex HMAC-SHA256 of
//! `"{t}.{raw body}"` under the endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, PartialEq, Eq)]
struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, ServiceError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    ServiceError::InvalidSignature("malformed signature timestamp".to_string())
                })?);
            }
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        ServiceError::InvalidSignature("signature header has no timestamp".to_string())
    })?;
    if signatures.is_empty() {
        return Err(ServiceError::InvalidSignature(
            "signature header has no v1 signature".to_string(),
        ));
    }
    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ServiceError::InternalError("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Checks `header` against `payload`. Any matching `v1` entry is accepted;
/// the comparison is constant time. Timestamps further than `tolerance_secs`
/// from `now` are rejected.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> Result<(), ServiceError> {
    let parsed = parse_header(header)?;

    if now.abs_diff(parsed.timestamp) > tolerance_secs {
        return Err(ServiceError::InvalidSignature(
            "signature timestamp outside the tolerance window".to_string(),
        ));
    }

    let mac = mac_for(secret, parsed.timestamp, payload)?;
    let matched = parsed.signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(ServiceError::InvalidSignature(
            "no signature matches the payload".to_string(),
        ))
    }
}

/// Builds a header value signing `payload` at `timestamp`.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, ServiceError> {
    let signature = hex::encode(mac_for(secret, timestamp, payload)?.finalize().into_bytes());
    Ok(format!("t={},v1={}", timestamp, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn accepts_freshly_signed_payload() {
        let body = br#"{"type":"payment_intent.succeeded"}"#;
        let header = sign_payload(body, SECRET, NOW).unwrap();
        assert!(verify_signature(body, &header, SECRET, 300, NOW + 10).is_ok());
    }

    #[test]
    fn any_v1_entry_may_match() {
        let body = b"{}";
        let good = sign_payload(body, SECRET, NOW).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v0=legacy,v1={}", NOW, "00".repeat(32), good_sig);
        assert!(verify_signature(body, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let header = sign_payload(b"{\"amount\":100}", SECRET, NOW).unwrap();
        assert_matches!(
            verify_signature(b"{\"amount\":999}", &header, SECRET, 300, NOW),
            Err(ServiceError::InvalidSignature(_))
        );
        assert_matches!(
            verify_signature(b"{\"amount\":100}", &header, "whsec_other", 300, NOW),
            Err(ServiceError::InvalidSignature(_))
        );
    }

    #[test]
    fn rejects_stale_timestamps() {
        let header = sign_payload(b"{}", SECRET, NOW).unwrap();
        assert_matches!(
            verify_signature(b"{}", &header, SECRET, 300, NOW + 301),
            Err(ServiceError::InvalidSignature(_))
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        let missing_signature = format!("t={}", NOW);
        for header in ["", "v1=abc", "t=notanumber,v1=abc", missing_signature.as_str()] {
            assert_matches!(
                verify_signature(b"{}", header, SECRET, 300, NOW),
                Err(ServiceError::InvalidSignature(_))
            );
        }
    }
}
