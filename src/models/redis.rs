use uuid::Uuid;

pub struct RedisKey;

impl RedisKey {
    pub fn aggregate(namespace: &str, target_id: Uuid) -> String {
        format!("{namespace}:{target_id}")
    }

    pub fn rating(namespace: &str, target_id: Uuid, rater_id: Uuid) -> String {
        format!("{namespace}:{target_id}:ratings:{rater_id}")
    }

    /// Set of rater ids that have a rating on the target.
    pub fn raters(namespace: &str, target_id: Uuid) -> String {
        format!("{namespace}:{target_id}:ratings")
    }
}
