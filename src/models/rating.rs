use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::AppError;

/// A star value that has passed the 1..=5 check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Stars(u8);

impl Stars {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 5;

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Stars {
    type Error = AppError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Stars(value as u8))
        } else {
            Err(AppError::InvalidRating(value.to_string()))
        }
    }
}

/// Only whole JSON numbers can be stars; `3.5`, `"4"` and `null` are rejected.
impl TryFrom<&serde_json::Value> for Stars {
    type Error = AppError;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        match value.as_i64() {
            Some(stars) => Stars::try_from(stars),
            None => Err(AppError::InvalidRating(value.to_string())),
        }
    }
}

impl From<Stars> for i64 {
    fn from(stars: Stars) -> Self {
        i64::from(stars.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingRecord {
    pub rater_id: Uuid,
    pub target_id: Uuid,
    pub stars: u8,
    pub review: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub average_rating: f64,
    pub rating_count: u64,
    pub rating_sum: u64,
    pub version: u64,
}

impl Default for AggregateRecord {
    fn default() -> Self {
        Self {
            average_rating: 0.0,
            rating_count: 0,
            rating_sum: 0,
            version: 0,
        }
    }
}

/// What a submission transaction reads before computing its writes.
#[derive(Debug, Clone, Default)]
pub struct TxSnapshot {
    pub aggregate: Option<AggregateRecord>,
    pub rating: Option<RatingRecord>,
}

/// The pair of records a submission commits together.
#[derive(Debug, Clone)]
pub struct TxWrite {
    pub rating: RatingRecord,
    pub aggregate: AggregateRecord,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRatingPayload {
    #[serde(default)]
    pub stars: serde_json::Value,
    pub review: Option<String>,
}

const LEGACY_EXACT_COUNT: u64 = 1000;

fn parse_field<T: std::str::FromStr>(
    data: &HashMap<String, String>,
    field: &str,
) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    data.get(field)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| AppError::Deserialization(format!("Invalid {field} '{raw}': {e}")))
        })
        .transpose()
}

fn parse_time(
    data: &HashMap<String, String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, AppError> {
    data.get(field)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| AppError::Deserialization(format!("Invalid {field} '{raw}': {e}")))
        })
        .transpose()
}

impl AggregateRecord {
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("averageRating", self.average_rating.to_string()),
            ("ratingCount", self.rating_count.to_string()),
            ("ratingSum", self.rating_sum.to_string()),
            ("version", self.version.to_string()),
        ]
    }

    /// Decodes a stored hash. An empty hash means the record does not exist.
    pub fn from_fields(data: &HashMap<String, String>) -> Result<Option<Self>, AppError> {
        if data.is_empty() {
            return Ok(None);
        }

        let average_rating: f64 = parse_field(data, "averageRating")?.unwrap_or(0.0);
        let rating_count: u64 = parse_field(data, "ratingCount")?.unwrap_or(0);
        // Older records only carry the average, stored to three decimals. That
        // pins the sum exactly only while fewer than 1000 ratings exist.
        let rating_sum: u64 = match parse_field(data, "ratingSum")? {
            Some(sum) => sum,
            None => {
                let sum = (average_rating * rating_count as f64).round().max(0.0) as u64;
                if rating_count >= LEGACY_EXACT_COUNT {
                    tracing::warn!(
                        "Aggregate without ratingSum over {} ratings; reconstructed sum {} may be off",
                        rating_count,
                        sum
                    );
                }
                sum
            }
        };

        Ok(Some(Self {
            average_rating,
            rating_count,
            rating_sum,
            version: parse_field(data, "version")?.unwrap_or(0),
        }))
    }
}

impl RatingRecord {
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("raterId", self.rater_id.to_string()),
            ("targetId", self.target_id.to_string()),
            ("stars", self.stars.to_string()),
            ("review", self.review.clone()),
            ("createdAt", self.created_at.to_rfc3339()),
            ("updatedAt", self.updated_at.to_rfc3339()),
        ]
    }

    pub fn from_fields(
        target_id: Uuid,
        data: &HashMap<String, String>,
    ) -> Result<Option<Self>, AppError> {
        if data.is_empty() {
            return Ok(None);
        }

        let rater_id: Uuid = parse_field(data, "raterId")?
            .ok_or_else(|| AppError::Deserialization("Rating is missing raterId".into()))?;
        let stars: u8 = parse_field(data, "stars")?
            .ok_or_else(|| AppError::Deserialization("Rating is missing stars".into()))?;
        let updated_at = parse_time(data, "updatedAt")?;
        let created_at = parse_time(data, "createdAt")?.or(updated_at);

        let (Some(created_at), Some(updated_at)) = (created_at, updated_at.or(created_at)) else {
            return Err(AppError::Deserialization(
                "Rating is missing timestamps".into(),
            ));
        };

        Ok(Some(Self {
            rater_id,
            target_id: parse_field(data, "targetId")?.unwrap_or(target_id),
            stars,
            review: data.get("review").cloned().unwrap_or_default(),
            created_at,
            updated_at,
        }))
    }
}
