use super::config::AppConfig;
use crate::db::Db;
use crate::feed_manager::FeedHealth;
use crate::registry::SubscriptionRegistry;
use crate::store::KvStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<Db>,
    pub kv: Arc<KvStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub feed_health: FeedHealth,
}
