//! Fire ingress: POST /fire.
//!
//! Receives the envelope an external trigger registry delivers when a rule
//! fires. Authenticated according to `fire.auth_mode` in `GitsConfig`.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use gits_core::config::FireAuthMode;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use super::{scheduler_error, ApiError};
use crate::app::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the raw body.
pub const SIGNATURE_HEADER: &str = "x-gits-signature-256";

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /fire
///
/// Returns 200 with the outcome (including discards), 400 for an
/// undecodable envelope, 401 on auth failure, 502 when the status write fails.
pub async fn fire_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let cfg = &state.config.fire;

    match &cfg.auth_mode {
        FireAuthMode::HmacSha256 => {
            verify_hmac_sha256(&headers, &body, cfg.secret.as_deref())
                .map_err(|e| auth_error(&e))?;
        }
        FireAuthMode::BearerToken => {
            verify_bearer_token(&headers, cfg.secret.as_deref()).map_err(|e| auth_error(&e))?;
        }
        FireAuthMode::None => {}
    }

    info!(bytes = body.len(), "fire event arrived");

    let outcome = state
        .relay
        .on_trigger_bytes(&body)
        .await
        .map_err(|e| scheduler_error(&e))?;
    Ok(Json(json!(outcome)))
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

/// `sha256=<hex>` in [`SIGNATURE_HEADER`], keyed with the configured secret.
fn verify_hmac_sha256(headers: &HeaderMap, body: &Bytes, secret: Option<&str>) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured".to_string())?;

    let sig_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| format!("missing {SIGNATURE_HEADER} header"))?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| format!("malformed {SIGNATURE_HEADER} header"))?;

    let expected = hex::decode(sig_hex).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

/// Static token in `Authorization: Bearer <token>`.
fn verify_bearer_token(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let expected = secret.ok_or_else(|| "no bearer token configured".to_string())?;

    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    // Compare MACs keyed with the expected token so timing does not depend on
    // the common prefix.
    let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
        .map_err(|_| "invalid bearer token".to_string())?;
    mac.update(expected.as_bytes());
    let want = mac.finalize().into_bytes();

    let mut mac = HmacSha256::new_from_slice(expected.as_bytes())
        .map_err(|_| "invalid bearer token".to_string())?;
    mac.update(token.as_bytes());
    mac.verify_slice(&want)
        .map_err(|_| "bearer token mismatch".to_string())
}

fn auth_error(reason: &str) -> ApiError {
    warn!(reason = %reason, "fire authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "code": "UNAUTHORIZED"})),
    )
}

/// `sha256=<hex>` signature for `body`, as a trigger registry would send it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn hmac_accepts_own_signature_only() {
        let body = Bytes::from_static(br#"{"rule":"gits-1"}"#);
        let good = headers(SIGNATURE_HEADER, &sign("s3cret", &body).unwrap());
        assert!(verify_hmac_sha256(&good, &body, Some("s3cret")).is_ok());

        assert!(verify_hmac_sha256(&good, &body, Some("other")).is_err());
        assert!(verify_hmac_sha256(&good, &Bytes::from_static(b"{}"), Some("s3cret")).is_err());
        assert!(verify_hmac_sha256(&HeaderMap::new(), &body, Some("s3cret")).is_err());
        assert!(verify_hmac_sha256(&good, &body, None).is_err());
        let bad_hex = headers(SIGNATURE_HEADER, "sha256=zz");
        assert!(verify_hmac_sha256(&bad_hex, &body, Some("s3cret")).is_err());
    }

    #[test]
    fn bearer_token_checks() {
        let ok = headers("authorization", "Bearer tok");
        assert!(verify_bearer_token(&ok, Some("tok")).is_ok());
        assert!(verify_bearer_token(&ok, Some("tok2")).is_err());
        assert!(verify_bearer_token(&headers("authorization", "Basic tok"), Some("tok")).is_err());
        assert!(verify_bearer_token(&HeaderMap::new(), Some("tok")).is_err());
        assert!(verify_bearer_token(&ok, None).is_err());
    }
}
