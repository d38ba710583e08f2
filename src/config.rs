use std::{str::FromStr, time::Duration};

use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: Option<String>,
    pub port: u16,
    pub jwt_secret: String,
    pub namespace: String,
    pub max_tx_attempts: u32,
    pub store_timeout: Duration,
    pub allowed_origins: Vec<String>,
    pub max_concurrent_requests: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let redis_url = lookup("REDIS_URL").filter(|url| !url.trim().is_empty());

        let jwt_secret = lookup("JWT_SECRET")
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| AppError::EnvError("JWT_SECRET must be set".into()))?;

        let namespace = lookup("RATING_NAMESPACE")
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| "profiles".to_string());

        let max_tx_attempts: u32 = parse_or(&lookup, "MAX_TX_ATTEMPTS", 16)?;
        if max_tx_attempts == 0 {
            return Err(AppError::EnvError(
                "MAX_TX_ATTEMPTS must be at least 1".into(),
            ));
        }

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            redis_url,
            port: parse_or(&lookup, "PORT", 3001)?,
            jwt_secret,
            namespace,
            max_tx_attempts,
            store_timeout: Duration::from_millis(parse_or(&lookup, "STORE_TIMEOUT_MS", 5000)?),
            allowed_origins,
            max_concurrent_requests: parse_or(&lookup, "MAX_CONCURRENT_REQUESTS", 512)?,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| AppError::EnvError(format!("Invalid {key} '{raw}': {e}"))),
        None => Ok(default),
    }
}
