//! Bearer token identity resolution.
//!
//! Tokens are HS256 JWTs carrying a numeric `user_id` claim. Issuing them is
//! left to another service; this module only verifies.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use taskhub_api::ApiError;

/// Claims expected in a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub exp: u64,
}

/// The caller a request acts on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => ApiError::unauthorized("missing bearer token"),
            AuthError::InvalidToken(_) => ApiError::unauthorized("invalid token"),
        }
    }
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(Identity {
            user_id: data.claims.user_id,
        })
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Rejects requests without a valid bearer token and stores the
/// [`Identity`] in request extensions.
pub async fn require_identity(
    State(verifier): State<Arc<JwtVerifier>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(AuthError::MissingToken)?;
    let identity = verifier.verify(token).map_err(|e| {
        tracing::debug!(error = %e, "bearer token rejected");
        e
    })?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .copied()
            .ok_or_else(|| ApiError::unauthorized("missing identity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn token(secret: &str, user_id: i64, exp: u64) -> String {
        encode(
            &Header::default(),
            &Claims { user_id, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn far_future() -> u64 {
        4_102_444_800 // 2100-01-01
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = JwtVerifier::new("secret");
        let identity = verifier.verify(&token("secret", 42, far_future())).unwrap();
        assert_eq!(identity, Identity { user_id: 42 });
    }

    #[test]
    fn rejects_wrong_secret_and_expired_token() {
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify(&token("other", 1, far_future())).is_err());
        assert!(verifier.verify(&token("secret", 1, 1_000)).is_err());
        assert!(verifier.verify("not-a-jwt").is_err());
    }

    #[test]
    fn parses_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
