pub mod rating;
pub mod redis;
pub mod user;

pub use rating::{AggregateRecord, RatingRecord, Stars};
