//! API key comparison and the axum middleware that gates `/mcp` (or `/sse`
//! + `/messages`) behind it. `/health` is always reachable.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Length check first, then a byte-by-byte comparison that never
/// short-circuits on mismatch — so a timing attack can't learn the key one
/// byte at a time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Clone)]
pub struct ApiKeyState {
    pub expected: std::sync::Arc<String>,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"error": "Unauthorized"})),
    )
        .into_response()
}

pub async fn require_api_key(
    State(state): State<ApiKeyState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !constant_time_eq(provided, state.expected.as_str()) {
        return unauthorized();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_compare_equal() {
        assert!(constant_time_eq("secret-key", "secret-key"));
    }

    #[test]
    fn different_lengths_never_match() {
        assert!(!constant_time_eq("short", "much-longer-key"));
    }

    #[test]
    fn same_length_different_content_does_not_match() {
        assert!(!constant_time_eq("secret-key", "wrong-value"));
    }

    #[test]
    fn empty_key_only_matches_empty_header() {
        assert!(constant_time_eq("", ""));
        assert!(!constant_time_eq("", "anything"));
    }
}
