//! KV / pub-sub store (C8): latest-price cache, market-depth snapshots and
//! the order-plan event bus, all backed by one Redis deployment.
//!
//! Mirrors the shape of the teacher's `db` module (a thin struct wrapping a
//! driver handle plus a `health()` probe) but speaks to Redis instead of
//! Postgres, and additionally exposes pub/sub through the `EventBus` trait.

use crate::core::{AppConfig, AppError};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::debug;

/// Read/write access to the latest-price and market-depth caches (§4.8).
#[async_trait]
pub trait LatestPriceStore: Send + Sync {
    async fn set_latest_price(&self, symbol: &str, payload: &Value) -> Result<(), AppError>;
    async fn get_latest_price(&self, symbol: &str) -> Result<Option<Value>, AppError>;
    async fn set_market_depth(&self, symbol: &str, payload: &Value) -> Result<(), AppError>;
}

/// Publish/subscribe access for order-plan lifecycle events (§4.7, §4.8).
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), AppError>;

    /// Subscribes to `channels` and returns a stream of `(channel, raw payload)`.
    /// Each call opens its own dedicated connection; Redis pub/sub connections
    /// can't be multiplexed with regular commands.
    async fn subscribe(&self, channels: Vec<String>) -> Result<BoxStream<'static, (String, String)>, AppError>;
}

pub struct KvStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(config: &AppConfig) -> Result<Self, AppError> {
        let client = redis::Client::open(config.kv_url())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    /// Cheap liveness probe used by the `/healthz` surface (§4.11).
    pub async fn health(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await.is_ok()
    }

    fn latest_price_key(symbol: &str) -> String {
        format!("latest-price:{symbol}")
    }

    fn market_depth_key(symbol: &str) -> String {
        format!("marketdepth:{symbol}")
    }
}

#[async_trait]
impl LatestPriceStore for KvStore {
    async fn set_latest_price(&self, symbol: &str, payload: &Value) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        conn.set(Self::latest_price_key(symbol), body).await?;
        Ok(())
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Option<Value>, AppError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::latest_price_key(symbol)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set_market_depth(&self, symbol: &str, payload: &Value) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        conn.set(Self::market_depth_key(symbol), body).await?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for KvStore {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(payload)?;
        conn.publish(channel, body).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: Vec<String>) -> Result<BoxStream<'static, (String, String)>, AppError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(?channels, "subscribed to pub/sub channels");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => Some((channel, payload)),
                    Err(_) => None,
                }
            })
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_naming_matches_dispatcher_conventions() {
        assert_eq!(KvStore::latest_price_key("RELIANCE"), "latest-price:RELIANCE");
        assert_eq!(KvStore::market_depth_key("RELIANCE"), "marketdepth:RELIANCE");
    }
}
