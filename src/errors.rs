use axum::http::StatusCode;
use redis::RedisError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Self rating is forbidden")]
    SelfRatingForbidden,

    #[error("Invalid rating: {0} (expected 1-5 stars)")]
    InvalidRating(String),

    #[error("Transaction aborted after {attempts} attempts")]
    TransactionAborted { attempts: u32 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Env error: {0}")]
    EnvError(String),

    #[error("Internal server error")]
    InternalError,

    #[error("Not found")]
    NotFound(String),
}

impl From<RedisError> for AppError {
    fn from(err: RedisError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

impl From<bb8::RunError<RedisError>> for AppError {
    fn from(err: bb8::RunError<RedisError>) -> Self {
        match err {
            bb8::RunError::User(err) => err.into(),
            bb8::RunError::TimedOut => {
                AppError::StoreUnavailable("Redis connection timed out".into())
            }
        }
    }
}

impl AppError {
    pub fn to_response(&self) -> (StatusCode, String) {
        match self {
            AppError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::SelfRatingForbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::InvalidRating(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::TransactionAborted { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::StoreUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Serialization(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Deserialization(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::EnvError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::InternalError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Unexpected server error".into(),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        }
    }
}
