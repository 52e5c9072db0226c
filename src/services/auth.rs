//! Caller authentication.
//!
//! Tokens are HS256 JWTs whose subject is the user's UUID.

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Issuer stamped into access tokens.
pub const TOKEN_ISSUER: &str = "tubely-access";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to the user it was issued for.
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError>;
}

/// JWT claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String, // User ID
    pub iat: usize,
    pub exp: usize,
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Uuid, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
        Uuid::parse_str(&data.claims.sub)
            .map_err(|err| AuthError::InvalidToken(format!("subject is not a user id: {err}")))
    }
}

/// Pull the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)
}
