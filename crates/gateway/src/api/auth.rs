//! Bearer-token auth.
//!
//! The token is hashed once at startup; requests compare in constant
//! time. No configured token means dev mode: everything passes.

use axum::http::{HeaderMap, StatusCode};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.api_token_hash else {
        return Ok(());
    };

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let provided_hash = Sha256::digest(provided.as_bytes());
    if provided_hash.as_slice().ct_eq(expected.as_slice()).into() {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
