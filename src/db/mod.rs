pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::rating::{AggregateRecord, RatingRecord, TxSnapshot, TxWrite},
};

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

/// Computes the writes for one transaction attempt from a fresh snapshot.
/// Called again on every retry, so it must not carry state between calls.
pub type TxFn = Arc<dyn Fn(TxSnapshot) -> Result<TxWrite, AppError> + Send + Sync>;

#[async_trait]
pub trait RatingStore: Send + Sync {
    async fn read_aggregate(&self, target_id: Uuid) -> Result<Option<AggregateRecord>, AppError>;

    async fn read_rating(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
    ) -> Result<Option<RatingRecord>, AppError>;

    /// Every current rating on the target, oldest first.
    async fn list_ratings(&self, target_id: Uuid) -> Result<Vec<RatingRecord>, AppError>;

    /// Reads the target aggregate and the rater's record, runs `apply`, and
    /// commits both returned records atomically. Conflicting commits restart
    /// from a fresh read until the attempt bound is hit.
    async fn transact(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
        apply: TxFn,
    ) -> Result<TxWrite, AppError>;
}
