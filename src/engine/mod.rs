pub mod aggregate;

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    auth::IdentityProvider,
    db::{RatingStore, TxFn},
    errors::AppError,
    feed::{ChangeFeed, SubscriptionHandle},
    models::rating::{AggregateRecord, RatingRecord, Stars, TxSnapshot, TxWrite},
};

use aggregate::next_aggregate;

/// Keeps every target's aggregate in step with its per-rater records.
pub struct RatingEngine {
    store: Arc<dyn RatingStore>,
    feed: Arc<ChangeFeed>,
}

impl RatingEngine {
    pub fn new(store: Arc<dyn RatingStore>) -> Self {
        Self {
            store,
            feed: Arc::new(ChangeFeed::new()),
        }
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// Records `stars` from the current identity for `target_id` and returns
    /// the committed aggregate.
    ///
    /// Input is validated before the store is touched. The transaction runs on
    /// its own task, so dropping the returned future leaves the target either
    /// untouched or fully committed. Subscribers are notified from that task
    /// and may see the change after this returns.
    pub async fn submit(
        &self,
        identity: &impl IdentityProvider,
        target_id: Uuid,
        stars: i64,
        review: Option<String>,
    ) -> Result<AggregateRecord, AppError> {
        let rater_id = self.authorize(identity, target_id)?;
        let stars = Stars::try_from(stars)?;
        let review = review
            .map(|text| text.trim().to_string())
            .unwrap_or_default();

        let apply: TxFn = Arc::new(move |snapshot: TxSnapshot| -> Result<TxWrite, AppError> {
            let now = Utc::now();
            let prior = snapshot.aggregate.unwrap_or_default();
            let prior_stars = snapshot.rating.as_ref().map(|rating| rating.stars);
            let created_at = snapshot
                .rating
                .as_ref()
                .map_or(now, |rating| rating.created_at);

            Ok(TxWrite {
                rating: RatingRecord {
                    rater_id,
                    target_id,
                    stars: stars.get(),
                    review: review.clone(),
                    created_at,
                    updated_at: now,
                },
                aggregate: next_aggregate(&prior, prior_stars, stars),
            })
        });

        let store = self.store.clone();
        let feed = self.feed.clone();
        let (done_tx, done_rx) = oneshot::channel();
        feed.begin(target_id);
        tokio::spawn(async move {
            let outcome = match store.transact(target_id, rater_id, apply).await {
                Ok(write) => {
                    tracing::info!(
                        "Rating by {} on {}: {} stars, aggregate now {} over {} (v{})",
                        rater_id,
                        target_id,
                        write.rating.stars,
                        write.aggregate.average_rating,
                        write.aggregate.rating_count,
                        write.aggregate.version
                    );
                    Ok(write.aggregate)
                }
                Err(e @ AppError::TransactionAborted { .. }) => {
                    tracing::warn!("Rating by {} on {} aborted: {}", rater_id, target_id, e);
                    Err(e)
                }
                Err(e) => {
                    tracing::error!("Rating by {} on {} failed: {}", rater_id, target_id, e);
                    Err(e)
                }
            };

            let committed = outcome.as_ref().ok().cloned();
            // The caller may be gone already; the commit still fans out.
            let _ = done_tx.send(outcome);
            fan_out(store, feed, target_id, committed).await;
        });

        done_rx.await.map_err(|e| {
            tracing::error!("Rating transaction task failed: {}", e);
            AppError::InternalError
        })?
    }

    /// The identity and self-rating checks `submit` runs first, returning the
    /// rater.
    pub fn authorize(
        &self,
        identity: &impl IdentityProvider,
        target_id: Uuid,
    ) -> Result<Uuid, AppError> {
        let rater_id = identity
            .current_identity()
            .ok_or_else(|| AppError::Unauthenticated("Sign in to submit a rating".into()))?;

        if rater_id == target_id {
            return Err(AppError::SelfRatingForbidden);
        }
        Ok(rater_id)
    }

    /// Point read; a target nobody has rated yields the zero aggregate.
    pub async fn get_aggregate(&self, target_id: Uuid) -> Result<AggregateRecord, AppError> {
        Ok(self
            .store
            .read_aggregate(target_id)
            .await?
            .unwrap_or_default())
    }

    pub async fn get_rating(
        &self,
        target_id: Uuid,
        rater_id: Uuid,
    ) -> Result<Option<RatingRecord>, AppError> {
        self.store.read_rating(target_id, rater_id).await
    }

    pub async fn list_ratings(&self, target_id: Uuid) -> Result<Vec<RatingRecord>, AppError> {
        self.store.list_ratings(target_id).await
    }

    /// Calls `on_change` with the current aggregate, then with every later
    /// committed change for the target until [`RatingEngine::unsubscribe`].
    pub async fn subscribe<F>(
        &self,
        target_id: Uuid,
        on_change: F,
    ) -> Result<SubscriptionHandle, AppError>
    where
        F: Fn(&AggregateRecord) + Send + Sync + 'static,
    {
        // Register before reading so no commit slips between the read and
        // the registration.
        let handle = self.feed.register(target_id, Arc::new(on_change));

        match self.get_aggregate(target_id).await {
            Ok(current) => {
                self.feed.deliver_initial(&handle, &current);
                Ok(handle)
            }
            Err(e) => {
                self.feed.unsubscribe(&handle);
                Err(e)
            }
        }
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.feed.unsubscribe(handle)
    }
}

/// Runs subscriber callbacks for a finished commit off the async workers, then
/// re-reads the target if the feed reports a version it will never hear about.
async fn fan_out(
    store: Arc<dyn RatingStore>,
    feed: Arc<ChangeFeed>,
    target_id: Uuid,
    committed: Option<AggregateRecord>,
) {
    let settle_feed = feed.clone();
    let settled = tokio::task::spawn_blocking(move || match committed {
        Some(record) => settle_feed.publish(target_id, &record),
        None => settle_feed.abandon(target_id),
    })
    .await;

    match settled {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            tracing::error!("Change delivery for {} failed: {}", target_id, e);
            return;
        }
    }

    let current = match store.read_aggregate(target_id).await {
        Ok(current) => current.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("Could not resync change feed for {}: {}", target_id, e);
            return;
        }
    };

    if let Err(e) = tokio::task::spawn_blocking(move || feed.resync(target_id, &current)).await {
        tracing::error!("Change delivery for {} failed: {}", target_id, e);
    }
}
