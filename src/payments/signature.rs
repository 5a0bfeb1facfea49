//! Signature checks for gateway callbacks and webhooks.
//!
//! All comparisons go through `Mac::verify_slice`, which is constant time.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const GATEWAY_SIGNATURE_HEADER: &str = "x-gateway-signature";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

fn mac(secret: &str) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

fn verify_hex(mac: HmacSha256, signature_hex: &str) -> bool {
    match hex::decode(signature_hex.trim()) {
        Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
        Err(_) => false,
    }
}

/// `hex(HMAC-SHA256(secret, "{order_id}|{payment_id}"))`, the value the
/// gateway hands the client after a successful checkout.
pub fn callback_signature(secret: &str, gateway_order_id: &str, gateway_payment_id: &str) -> String {
    match mac(secret) {
        Some(mut mac) => {
            mac.update(gateway_order_id.as_bytes());
            mac.update(b"|");
            mac.update(gateway_payment_id.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => String::new(),
    }
}

pub fn verify_callback_signature(
    secret: &str,
    gateway_order_id: &str,
    gateway_payment_id: &str,
    signature: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(mut mac) = mac(secret) else {
        return false;
    };
    mac.update(gateway_order_id.as_bytes());
    mac.update(b"|");
    mac.update(gateway_payment_id.as_bytes());
    verify_hex(mac, signature)
}

/// Verifies a webhook delivery.
///
/// Accepts either `x-gateway-signature: hex(HMAC(secret, body))` or
/// `Stripe-Signature: t=<unix>,v1=<hex(HMAC(secret, "{t}.{body}"))>` where `t`
/// must be within `tolerance_secs` of `now`.
pub fn verify_webhook_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: u64,
    now: i64,
) -> bool {
    if secret.is_empty() {
        return false;
    }

    if let Some(sig) = headers
        .get(GATEWAY_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        let Some(mut mac) = mac(secret) else {
            return false;
        };
        mac.update(payload);
        return verify_hex(mac, sig);
    }

    if let Some(sig) = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        let mut ts = "";
        let mut candidates = Vec::new();
        for part in sig.split(',') {
            match part.trim().split_once('=') {
                Some(("t", val)) => ts = val,
                Some(("v1", val)) => candidates.push(val),
                _ => {}
            }
        }

        let Ok(ts_i) = ts.parse::<i64>() else {
            return false;
        };
        if now.abs_diff(ts_i) > tolerance_secs {
            return false;
        }

        return candidates.into_iter().any(|candidate| match mac(secret) {
            Some(mut mac) => {
                mac.update(ts.as_bytes());
                mac.update(b".");
                mac.update(payload);
                verify_hex(mac, candidate)
            }
            None => false,
        });
    }

    false
}
