use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    db::{RatingStore, TxFn},
    errors::AppError,
    models::{
        rating::{AggregateRecord, RatingRecord, TxSnapshot, TxWrite},
        redis::RedisKey,
    },
    state::RedisClient,
};

pub struct RedisStore {
    redis: RedisClient,
    namespace: String,
    max_attempts: u32,
}

enum Attempt {
    Committed(TxWrite),
    Conflict,
}

impl RedisStore {
    pub fn new(redis: RedisClient, namespace: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            redis,
            namespace: namespace.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    async fn attempt(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        target_id: Uuid,
        rater_id: Uuid,
        apply: &TxFn,
    ) -> Result<Attempt, AppError> {
        let aggregate_key = RedisKey::aggregate(&self.namespace, target_id);
        let rating_key = RedisKey::rating(&self.namespace, target_id, rater_id);
        let raters_key = RedisKey::raters(&self.namespace, target_id);

        let _: () = redis::cmd("WATCH")
            .arg(&aggregate_key)
            .arg(&rating_key)
            .query_async(&mut *conn)
            .await?;

        let aggregate: HashMap<String, String> = conn.hgetall(&aggregate_key).await?;
        let rating: HashMap<String, String> = conn.hgetall(&rating_key).await?;

        let snapshot = TxSnapshot {
            aggregate: AggregateRecord::from_fields(&aggregate)?,
            rating: RatingRecord::from_fields(target_id, &rating)?,
        };
        let write = apply(snapshot)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(&rating_key, &write.rating.to_fields())
            .ignore();
        pipe.hset_multiple(&aggregate_key, &write.aggregate.to_fields())
            .ignore();
        pipe.sadd(&raters_key, rater_id.to_string()).ignore();
        pipe.hget(&aggregate_key, "version");

        // EXEC replies nil when a watched key changed since WATCH.
        let committed: Option<(u64,)> = pipe.query_async(&mut *conn).await?;

        Ok(match committed {
            Some(_) => Attempt::Committed(write),
            None => Attempt::Conflict,
        })
    }
}

#[async_trait]
impl RatingStore for RedisStore {
    async fn read_aggregate(&self, target_id: Uuid) -> Result<Option<AggregateRecord>, AppError> {
        let mut conn = self.redis.get().await?;

        let key = RedisKey::aggregate(&self.namespace, target_id);
        let data: HashMap<String, String> = conn.hgetall(&key).await?;

        AggregateRecord::from_fields(&data)
    }

    async fn read_rating(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
    ) -> Result<Option<RatingRecord>, AppError> {
        let mut conn = self.redis.get().await?;

        let key = RedisKey::rating(&self.namespace, target_id, rater_id);
        let data: HashMap<String, String> = conn.hgetall(&key).await?;

        RatingRecord::from_fields(target_id, &data)
    }

    async fn list_ratings(&self, target_id: Uuid) -> Result<Vec<RatingRecord>, AppError> {
        let mut conn = self.redis.get().await?;

        let rater_ids: Vec<String> = conn
            .smembers(RedisKey::raters(&self.namespace, target_id))
            .await?;

        if rater_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for rater_id in &rater_ids {
            let rater_id = Uuid::parse_str(rater_id).map_err(|e| {
                AppError::Deserialization(format!("Invalid rater id '{}': {}", rater_id, e))
            })?;
            pipe.hgetall(RedisKey::rating(&self.namespace, target_id, rater_id));
        }

        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut *conn).await?;

        let mut ratings = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = RatingRecord::from_fields(target_id, row)? {
                ratings.push(record);
            }
        }
        ratings.sort_by_key(|record| (record.created_at, record.rater_id));

        Ok(ratings)
    }

    async fn transact(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
        apply: TxFn,
    ) -> Result<TxWrite, AppError> {
        let mut conn = self.redis.get().await?;

        for attempt in 1..=self.max_attempts {
            match self.attempt(&mut conn, target_id, rater_id, &apply).await {
                Ok(Attempt::Committed(write)) => return Ok(write),
                Ok(Attempt::Conflict) => {
                    tracing::debug!(
                        "Write conflict on target {} (attempt {}/{})",
                        target_id,
                        attempt,
                        self.max_attempts
                    );
                }
                Err(e) => {
                    // The connection goes back to the pool; drop any watch left on it.
                    let unwatch: Result<(), _> =
                        redis::cmd("UNWATCH").query_async(&mut *conn).await;
                    if let Err(unwatch_err) = unwatch {
                        tracing::warn!("Failed to UNWATCH after error: {}", unwatch_err);
                    }
                    return Err(e);
                }
            }
        }

        Err(AppError::TransactionAborted {
            attempts: self.max_attempts,
        })
    }
}
