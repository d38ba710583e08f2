use crate::models::rating::{AggregateRecord, Stars};

/// Rounds half away from zero to three decimal places.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Folds one submission into the prior aggregate.
///
/// `prior_stars` is the rater's existing contribution, if any. A rater that
/// already counted replaces their stars; a new rater adds one to the count.
pub fn next_aggregate(
    prior: &AggregateRecord,
    prior_stars: Option<u8>,
    stars: Stars,
) -> AggregateRecord {
    let stars = u64::from(stars.get());

    let (sum, count) = match prior_stars {
        Some(previous) => (
            prior
                .rating_sum
                .saturating_sub(u64::from(previous))
                .saturating_add(stars),
            prior.rating_count,
        ),
        None => (prior.rating_sum.saturating_add(stars), prior.rating_count + 1),
    };

    let average_rating = if count > 0 {
        round3(sum as f64 / count as f64)
    } else {
        0.0
    };

    AggregateRecord {
        average_rating,
        rating_count: count,
        rating_sum: sum,
        version: prior.version + 1,
    }
}
