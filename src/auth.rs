//! Bearer-token identity for API requests.
//!
//! Tokens are HS256 JWTs whose claims carry the numeric `userID`. The
//! [`AuthUser`] extractor runs before any request body is read, so an
//! unauthenticated upload is rejected before a single part is touched.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header not found")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userID")]
    pub user_id: i64,
    pub exp: u64,
}

/// Verifies access tokens with a shared secret.
#[derive(Clone)]
pub struct JwtAuth {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl JwtAuth {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: Arc::new(DecodingKey::from_secret(secret)),
            validation: Arc::new(Validation::new(Algorithm::HS256)),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        Ok(decode::<Claims>(token, &self.key, &self.validation)?.claims)
    }
}

/// Identity of the caller, taken from the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingToken)?;
        // Accept "Bearer <token>" as well as a bare token.
        let token = header
            .split_once(' ')
            .map_or(header, |(_, token)| token)
            .trim();
        let claims = state.auth.verify(token)?;
        Ok(AuthUser {
            user_id: claims.user_id,
        })
    }
}
