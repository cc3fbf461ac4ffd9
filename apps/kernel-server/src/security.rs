// apps/kernel-server/src/security.rs
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::server::KernelState;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Proof that the request carried the configured API key. With no key configured every request passes.
pub struct ApiKey;

#[async_trait]
impl FromRequestParts<Arc<KernelState>> for ApiKey {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<KernelState>,
    ) -> Result<Self, Self::Rejection> {
        let expected = match state.config.api_key.as_deref() {
            Some(key) => key,
            None => return Ok(ApiKey),
        };

        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok());

        if provided == Some(expected) {
            return Ok(ApiKey);
        }

        tracing::warn!("Rejected {} {}: bad or missing API key", parts.method, parts.uri.path());
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error", "message": "Invalid API key" })),
        ))
    }
}
