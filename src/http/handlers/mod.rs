pub mod rating;

pub use rating::{
    get_aggregate_handler, get_rating_handler, list_ratings_handler, submit_rating_handler,
};
