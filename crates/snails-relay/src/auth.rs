//! Wallet signature verification.
//!
//! A client proves control of a wallet address by posting an ADR-36
//! signature over a message of its choosing. Verified signatures are
//! recorded on the user's node; they do not gate later graph writes.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use snails_shared::adr36::verify_adr36;
use snails_shared::graph::{child_soul, explode, now_state};
use snails_shared::StdSignature;

use crate::api::AppState;
use crate::error::ServerError;
use crate::socket::merge_and_broadcast;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub address: String,
    pub signature: StdSignature,
    pub message: String,
}

pub async fn verify_signature(
    State(state): State<AppState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<Value>, ServerError> {
    let address = req.address.trim();
    if address.is_empty() {
        return Err(ServerError::BadRequest("address is required".into()));
    }

    if !state.auth_limiter.check(address).await {
        return Err(ServerError::RateLimited(address.to_string()));
    }

    if let Err(e) = verify_adr36(address, req.message.as_bytes(), &req.signature) {
        warn!(address, error = %e, "Signature verification failed");
        return Err(e.into());
    }

    record_verification(&state, address, &req)?;
    info!(address, "Wallet signature verified");

    Ok(Json(json!({ "ok": true })))
}

/// Store the verified signature under `users/<address>/auth`.
fn record_verification(
    state: &AppState,
    address: &str,
    req: &VerifyRequest,
) -> Result<(), ServerError> {
    let mut auth = Map::new();
    auth.insert("pubKey".into(), Value::String(req.signature.pub_key.value.clone()));
    auth.insert("signature".into(), Value::String(req.signature.signature.clone()));
    auth.insert("message".into(), Value::String(req.message.clone()));
    auth.insert("verifiedAt".into(), json!(chrono::Utc::now().timestamp_millis()));

    let mut user = Map::new();
    user.insert("auth".into(), Value::Object(auth));

    let soul = child_soul("users", address);
    let nodes = explode(&soul, &user, now_state())
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    merge_and_broadcast(state, None, &nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::build_router;
    use crate::config::RelayConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use k256::ecdsa::SigningKey;
    use snails_shared::adr36::{sign_adr36, signing_key_address};
    use snails_shared::GraphValue;
    use snails_store::Database;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState::new(RelayConfig::default(), Database::open_in_memory().unwrap())
    }

    fn signed_body(message: &str) -> (String, Value) {
        let key = SigningKey::random(&mut rand::thread_rng());
        let address = signing_key_address(&key, "stars").unwrap();
        let signature = sign_adr36(&key, &address, message.as_bytes());
        let body = json!({
            "address": address,
            "signature": signature,
            "message": message,
        });
        (address, body)
    }

    async fn post(state: AppState, body: &Value) -> (StatusCode, Value) {
        let response = build_router(state)
            .oneshot(
                Request::post("/auth/verify")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_valid_signature_is_recorded() {
        let state = state();
        let (address, body) = signed_body("login");

        let (status, json) = post(state.clone(), &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);

        let store = state.store();
        let user = store.get_node(&format!("users/{address}")).unwrap().unwrap();
        assert_eq!(
            user.get("auth"),
            Some(&GraphValue::Link(format!("users/{address}/auth")))
        );
        let auth = store.get_node(&format!("users/{address}/auth")).unwrap().unwrap();
        assert_eq!(auth.get("message"), Some(&GraphValue::Text("login".into())));
    }

    #[tokio::test]
    async fn test_tampered_message_rejected() {
        let (_, mut body) = signed_body("login");
        body["message"] = json!("something else");

        let (status, json) = post(state(), &body).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(json["err"].is_string());
    }

    #[tokio::test]
    async fn test_sixth_attempt_rate_limited() {
        let state = state();
        let (_, body) = signed_body("login");

        for _ in 0..5 {
            let (status, _) = post(state.clone(), &body).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, json) = post(state, &body).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(json["err"].as_str().unwrap().contains("Too many"));
    }
}
