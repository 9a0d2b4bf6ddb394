//! Redis Support
//!
//! Thin wrapper over a shared `ConnectionManager` for the two things the
//! engine needs Redis for: the health-probe hash with TTL and advisory
//! locks (periodic-job runs, optional per-user ingestion locks).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::Settings;
use crate::error::Result;

/// Shared async Redis handle
#[derive(Clone)]
pub struct RedisHandle {
    manager: ConnectionManager,
}

impl RedisHandle {
    /// Connect using the deployment settings
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Write a string hash and bound its staleness with a TTL
    pub async fn set_hash_with_ttl(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_seconds: u64,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let () = conn.hset_multiple(key, fields).await?;
        let () = conn.expire(key, ttl_seconds as i64).await?;
        Ok(())
    }

    /// Read a whole hash
    pub async fn get_hash(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.manager.clone();
        let map: Vec<(String, String)> = conn.hgetall(key).await?;
        Ok(map)
    }

    /// Acquire an advisory lock: `SET key token NX PX ttl_ms`
    ///
    /// Returns whether the lock was taken. Locks expire on their own; the
    /// token guards release against stealing a successor's lock.
    pub async fn try_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let taken: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(taken.is_some())
    }

    /// Release a lock if this holder still owns it
    pub async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        // Compare-and-delete must be atomic server-side
        const UNLOCK_SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let released: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }
}
