use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::sync::Arc;

use crate::{config::Config, engine::RatingEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RatingEngine>,
    pub config: Arc<Config>,
}

pub type RedisClient = Pool<RedisConnectionManager>;
