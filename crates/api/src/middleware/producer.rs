//! Shared-key authentication for upstream producers on the ingestion API.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use courier_common::error::AppError;

use crate::state::AppState;

pub const PRODUCER_KEY_HEADER: &str = "x-producer-key";

/// Marker extractor: the request carried the configured producer key.
#[derive(Debug, Clone, Copy)]
pub struct Producer;

/// Compare without short-circuiting on the first differing byte.
fn keys_match(expected: &str, presented: &str) -> bool {
    expected.len() == presented.len()
        && expected
            .bytes()
            .zip(presented.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

impl FromRequestParts<AppState> for Producer {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.producer_api_key.as_deref() else {
            return Err(AppError::Auth(
                "Ingestion is disabled: no producer key configured".to_string(),
            ));
        };

        let presented = parts
            .headers
            .get(PRODUCER_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Auth("Missing X-Producer-Key header".to_string()))?;

        if keys_match(expected, presented) {
            Ok(Producer)
        } else {
            Err(AppError::Auth("Invalid producer key".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_match() {
        assert!(keys_match("s3cret", "s3cret"));
        assert!(!keys_match("s3cret", "s3cres"));
        assert!(!keys_match("s3cret", "s3cret-longer"));
        assert!(!keys_match("s3cret", ""));
    }
}
