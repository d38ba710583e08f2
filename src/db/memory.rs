use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use uuid::Uuid;

use crate::{
    db::{RatingStore, TxFn},
    errors::AppError,
    models::rating::{AggregateRecord, RatingRecord, TxSnapshot, TxWrite},
};

#[derive(Default)]
struct MemoryState {
    aggregates: HashMap<Uuid, AggregateRecord>,
    // (target, rater) -> (revision, record)
    ratings: HashMap<(Uuid, Uuid), (u64, RatingRecord)>,
}

/// Process-local store with optimistic, versioned commits.
///
/// Reads and commits take the lock separately; the snapshot revisions are
/// compared at commit time and a mismatch restarts the attempt, the same
/// way a `WATCH`ed key does in Redis.
pub struct InMemoryStore {
    max_attempts: u32,
    inner: Arc<Mutex<MemoryState>>,
    forced_conflicts: AtomicU32,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            inner: Arc::new(Mutex::new(MemoryState::default())),
            forced_conflicts: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes the next `count` commits fail as if another writer got there first.
    pub fn force_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("memory store is offline".into()));
        }
        self.inner
            .lock()
            .map_err(|_| AppError::StoreUnavailable("memory store lock poisoned".into()))
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn revisions(state: &MemoryState, target_id: Uuid, rater_id: Uuid) -> (u64, u64) {
        let aggregate = state
            .aggregates
            .get(&target_id)
            .map_or(0, |aggregate| aggregate.version);
        let rating = state
            .ratings
            .get(&(target_id, rater_id))
            .map_or(0, |(revision, _)| *revision);
        (aggregate, rating)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl RatingStore for InMemoryStore {
    async fn read_aggregate(&self, target_id: Uuid) -> Result<Option<AggregateRecord>, AppError> {
        Ok(self.lock()?.aggregates.get(&target_id).cloned())
    }

    async fn read_rating(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
    ) -> Result<Option<RatingRecord>, AppError> {
        Ok(self
            .lock()?
            .ratings
            .get(&(target_id, rater_id))
            .map(|(_, record)| record.clone()))
    }

    async fn list_ratings(&self, target_id: Uuid) -> Result<Vec<RatingRecord>, AppError> {
        let mut ratings: Vec<RatingRecord> = self
            .lock()?
            .ratings
            .iter()
            .filter(|((target, _), _)| *target == target_id)
            .map(|(_, (_, record))| record.clone())
            .collect();
        ratings.sort_by_key(|record| (record.created_at, record.rater_id));
        Ok(ratings)
    }

    async fn transact(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
        apply: TxFn,
    ) -> Result<TxWrite, AppError> {
        for attempt in 1..=self.max_attempts {
            let (snapshot, seen) = {
                let state = self.lock()?;
                let snapshot = TxSnapshot {
                    aggregate: state.aggregates.get(&target_id).cloned(),
                    rating: state
                        .ratings
                        .get(&(target_id, rater_id))
                        .map(|(_, record)| record.clone()),
                };
                (snapshot, Self::revisions(&state, target_id, rater_id))
            };

            let write = apply(snapshot)?;

            // Let other transactions run between read and commit.
            tokio::task::yield_now().await;

            let mut state = self.lock()?;
            if Self::revisions(&state, target_id, rater_id) != seen || self.take_forced_conflict() {
                tracing::debug!(
                    "Write conflict on target {} (attempt {}/{})",
                    target_id,
                    attempt,
                    self.max_attempts
                );
                continue;
            }

            state
                .ratings
                .insert((target_id, rater_id), (seen.1 + 1, write.rating.clone()));
            state.aggregates.insert(target_id, write.aggregate.clone());
            return Ok(write);
        }

        Err(AppError::TransactionAborted {
            attempts: self.max_attempts,
        })
    }
}
