use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::TypedHeader;
use chrono::{Duration, Utc};
use headers::{Authorization, authorization::Bearer};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use std::convert::Infallible;
use uuid::Uuid;

use crate::{errors::AppError, models::user::Claims, state::AppState};

/// Answers "who is submitting". Sessions live with whoever implements this.
pub trait IdentityProvider {
    fn current_identity(&self) -> Option<Uuid>;
}

impl IdentityProvider for Option<Uuid> {
    fn current_identity(&self) -> Option<Uuid> {
        *self
    }
}

/// The bearer token's subject, or `None` when the token is missing or invalid.
#[derive(Debug, Clone, Copy)]
pub struct CurrentIdentity(pub Option<Uuid>);

impl IdentityProvider for CurrentIdentity {
    fn current_identity(&self) -> Option<Uuid> {
        self.0
    }
}

impl FromRequestParts<AppState> for CurrentIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Ok(TypedHeader(Authorization(bearer))) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state).await
        else {
            return Ok(CurrentIdentity(None));
        };

        match decode_identity(bearer.token(), &state.config.jwt_secret) {
            Ok(user_id) => Ok(CurrentIdentity(Some(user_id))),
            Err(e) => {
                tracing::debug!("Rejected bearer token: {}", e);
                Ok(CurrentIdentity(None))
            }
        }
    }
}

pub fn decode_identity(token: &str, secret: &str) -> Result<Uuid, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| AppError::Unauthenticated("Invalid or expired token".into()))?;

    Uuid::parse_str(&token_data.claims.sub)
        .map_err(|_| AppError::Unauthenticated("Token subject is not a user id".into()))
}

pub fn generate_jwt(user_id: Uuid, secret: &str, ttl: Duration) -> Result<String, AppError> {
    let expiration = (Utc::now() + ttl).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Serialization(e.to_string()))
}
