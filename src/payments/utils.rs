use crate::payments::error::{PaymentError, PaymentResult, ProviderErrorCode};
use hmac::{Hmac, Mac};
use md5::Md5;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Thin JSON-over-HTTPS client shared by the wallet adapters.
///
/// Every call is a single attempt. HTTP failures are classified into
/// retryable and terminal [`PaymentError`]s for the retry policy.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut request = self.client.request(method.clone(), url).timeout(self.timeout);

        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        for (k, v) in additional_headers {
            request = request.header(*k, *v);
        }
        if let Some(payload) = body {
            request = request.json(payload);
        }

        debug!(provider = self.provider, method = %method, url = %url, "provider request");

        let resp = request.send().await.map_err(|e| PaymentError::NetworkError {
            message: format!("{} request failed: {}", self.provider, e),
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if status.is_success() {
            return serde_json::from_str::<T>(&text).map_err(|e| PaymentError::ProviderError {
                provider: self.provider.to_string(),
                code: ProviderErrorCode::Unknown,
                message: format!("invalid provider JSON response: {}", e),
                retryable: false,
            });
        }

        if status.as_u16() == 429 {
            return Err(PaymentError::RateLimitError {
                message: format!("{} rate limit exceeded", self.provider),
                retry_after_seconds: None,
            });
        }

        if status.is_server_error() {
            warn!(provider = self.provider, status = %status, "provider server error");
        }

        let code = match status.as_u16() {
            401 | 403 => ProviderErrorCode::InvalidCredentials,
            404 => ProviderErrorCode::OrderNotFound,
            503 => ProviderErrorCode::ProviderBusy,
            _ => ProviderErrorCode::Unknown,
        };
        Err(PaymentError::ProviderError {
            provider: self.provider.to_string(),
            code,
            message: format!("HTTP {}: {}", status, text),
            retryable: status.is_server_error(),
        })
    }
}

/// `k1=v1&k2=v2` over the parameters in key order, skipping empty values
/// and any key listed in `skip`.
pub fn sorted_param_string(params: &BTreeMap<String, String>, skip: &[&str]) -> String {
    params
        .iter()
        .filter(|(k, v)| !v.is_empty() && !skip.contains(&k.as_str()))
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Flatten a JSON object's scalar members into string parameters.
pub fn json_params(value: &JsonValue) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some(object) = value.as_object() {
        for (k, v) in object {
            let rendered = match v {
                JsonValue::String(s) => s.clone(),
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                _ => continue,
            };
            params.insert(k.clone(), rendered);
        }
    }
    params
}

pub fn sha256_hex_upper(input: &str) -> String {
    hex::encode_upper(Sha256::digest(input.as_bytes()))
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    let computed = hmac_sha256_hex(secret, payload);
    !computed.is_empty()
        && secure_eq(
            computed.as_bytes(),
            signature.trim().to_lowercase().as_bytes(),
        )
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Normalise a Myanmar mobile number to the local `09…` form the wallets
/// expect. Accepts `+959…`, `959…` and `09…` with spaces or dashes.
pub fn normalize_msisdn(raw: &str) -> Option<String> {
    static MSISDN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = MSISDN
        .get_or_init(|| Regex::new(r"^(?:\+?95|0)(9\d{7,10})$").ok())
        .as_ref()?;
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let captures = pattern.captures(&compact)?;
    Some(format!("0{}", &captures[1]))
}

pub fn header_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msisdn_forms_normalise_to_local() {
        assert_eq!(normalize_msisdn("09791234567").as_deref(), Some("09791234567"));
        assert_eq!(normalize_msisdn("+95 9 791 234 567").as_deref(), Some("09791234567"));
        assert_eq!(normalize_msisdn("959-791234567").as_deref(), Some("09791234567"));
        assert_eq!(normalize_msisdn("0812345678"), None);
        assert_eq!(normalize_msisdn("not a phone"), None);
    }

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn sorted_params_skip_empty_and_excluded_keys() {
        let mut params = BTreeMap::new();
        params.insert("total_amount".to_string(), "1000".to_string());
        params.insert("appid".to_string(), "kp123".to_string());
        params.insert("sign".to_string(), "XYZ".to_string());
        params.insert("callback_info".to_string(), String::new());
        assert_eq!(
            sorted_param_string(&params, &["sign"]),
            "appid=kp123&total_amount=1000"
        );
    }

    #[test]
    fn digests_match_known_vectors() {
        assert_eq!(
            sha256_hex_upper("abc"),
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        );
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn hmac_roundtrip_verifies_and_rejects_tampering() {
        let payload = br#"{"orderId":"o1","status":"SUCCESS"}"#;
        let signature = hmac_sha256_hex("secret", payload);
        assert!(verify_hmac_sha256_hex(payload, "secret", &signature));
        assert!(verify_hmac_sha256_hex(
            payload,
            "secret",
            &signature.to_uppercase()
        ));
        assert!(!verify_hmac_sha256_hex(payload, "other", &signature));
        assert!(!verify_hmac_sha256_hex(b"{}", "secret", &signature));
    }

    #[test]
    fn json_params_keep_scalars_only() {
        let value = serde_json::json!({"a": "x", "b": 2, "c": true, "d": {"nested": 1}});
        let params = json_params(&value);
        assert_eq!(params.get("a").map(String::as_str), Some("x"));
        assert_eq!(params.get("b").map(String::as_str), Some("2"));
        assert_eq!(params.get("c").map(String::as_str), Some("true"));
        assert!(!params.contains_key("d"));
    }
}
