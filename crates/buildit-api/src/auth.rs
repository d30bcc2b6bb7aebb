//! Bearer token check for mutating endpoints.

use crate::AppState;
use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token, expected) => {
            Ok(next.run(request).await)
        }
        Some(_) => Err(ApiError::Unauthorized("invalid token".to_string())),
        None => Err(ApiError::Unauthorized("missing bearer token".to_string())),
    }
}

/// Compares tokens through their HMAC tags so the check takes the same
/// time wherever the first differing byte is, and for any token length.
fn token_matches(presented: &str, expected: &str) -> bool {
    let tag = |token: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(token.as_bytes());
            mac
        })
    };
    let (Ok(expected_tag), Ok(presented_mac)) = (tag(expected), tag(presented)) else {
        return false;
    };
    presented_mac
        .verify_slice(&expected_tag.finalize().into_bytes())
        .is_ok()
}
