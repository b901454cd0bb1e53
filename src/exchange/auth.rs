//! Bitget V2 request signing.
//!
//! REST: `sign = base64(HMAC-SHA256(secret, timestamp + method + path + body))`
//! where `path` includes the query string for GETs and `timestamp` is in ms.
//! WS login signs `timestamp + "GET" + "/user/verify"` with the timestamp in
//! seconds.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn sign(secret: &SecretString, prehash: &str) -> String {
    // HMAC accepts any key length; new_from_slice cannot fail for SHA-256.
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key size"));
    mac.update(prehash.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

pub fn rest_prehash(timestamp_ms: i64, method: &str, path_with_query: &str, body: &str) -> String {
    format!("{timestamp_ms}{method}{path_with_query}{body}")
}

pub fn ws_login_prehash(timestamp_s: i64) -> String {
    format!("{timestamp_s}GET/user/verify")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prehash_layouts() {
        assert_eq!(
            rest_prehash(1700000000000, "GET", "/api/v2/spot/public/symbols?symbol=ETHUSDT", ""),
            "1700000000000GET/api/v2/spot/public/symbols?symbol=ETHUSDT"
        );
        assert_eq!(ws_login_prehash(1700000000), "1700000000GET/user/verify");
    }

    #[test]
    fn test_sign_is_deterministic_base64() {
        let secret: SecretString = "top-secret".to_string().into();
        let a = sign(&secret, "1700000000000POST/api/v2/mix/order/place-order{}");
        let b = sign(&secret, "1700000000000POST/api/v2/mix/order/place-order{}");
        assert_eq!(a, b);
        assert!(BASE64.decode(&a).is_ok());
        assert_ne!(a, sign(&secret, "different"));
    }
}
