//! Redis-backed persistence for offline presence documents. Everything else
//! the relay holds is in-memory and transient; only presence pushed at a
//! user with no active sockets is written here, with a TTL.
//!
//! The connection manager is created lazily so state construction never
//! depends on Redis being up; `connect` forces it for the startup check.

use std::sync::Arc;

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::OnceCell;

#[derive(Clone)]
pub struct Storage {
    client: Client,
    ttl_seconds: u64,
    manager: Arc<OnceCell<ConnectionManager>>,
}

impl Storage {
    pub fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl_seconds,
            manager: Arc::new(OnceCell::new()),
        })
    }

    /// Establish the connection now; used at startup to fail fast.
    pub async fn connect(&self) -> Result<()> {
        self.conn().await?;
        Ok(())
    }

    async fn conn(&self) -> Result<ConnectionManager, redis::RedisError> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    fn presence_key(user_id: &str) -> String {
        format!("presence:{}", user_id)
    }

    pub async fn persist_presence(
        &self,
        user_id: &str,
        status: &serde_json::Value,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn().await?;
        let serialized = serde_json::to_string(status).unwrap_or_else(|_| "null".into());
        conn.set_ex::<_, _, ()>(Self::presence_key(user_id), serialized, self.ttl_seconds)
            .await
    }

    pub async fn fetch_presence(
        &self,
        user_id: &str,
    ) -> Result<Option<serde_json::Value>, redis::RedisError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(Self::presence_key(user_id)).await?;
        Ok(raw.and_then(|text| serde_json::from_str(&text).ok()))
    }
}
