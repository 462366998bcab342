//! Redis implementation of the queue store.
//!
//! Every atomic operation is one Lua script evaluated server-side (see
//! [`scripts`]); plain reads go through ordinary commands on a pooled
//! connection.

pub(crate) mod scripts;
mod pool;

use bb8_redis::bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;

use async_trait::async_trait;

use crate::config::MarqsConfig;
use crate::error::{MarqsError, MarqsResult};

use super::{
    AckKeys, Capacity, CapacityKeys, ConcurrencyDefaults, DequeueKeys, DequeuedHead, EnqueueKeys,
    NackKeys, QueueCapacities, QueueStore,
};

pub use self::pool::{create_redis_pool, RedisPoolConfig};

use self::scripts::Scripts;

/// Production store backed by a Redis (or Valkey) server.
pub struct RedisStore {
    pool: Pool<RedisConnectionManager>,
    scripts: Scripts,
}

impl RedisStore {
    /// Wrap an existing pool.
    pub fn new(pool: Pool<RedisConnectionManager>) -> Self {
        Self {
            pool,
            scripts: Scripts::new(),
        }
    }

    /// Build a pool from the configured connection parameters and verify
    /// connectivity.
    pub async fn connect(config: &MarqsConfig) -> MarqsResult<Self> {
        let pool = create_redis_pool(&config.redis.url(), RedisPoolConfig::default()).await?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> MarqsResult<PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MarqsError::Unavailable(format!("failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        message_id: &str,
        payload: &str,
        score_ms: i64,
    ) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: () = self
            .scripts
            .enqueue
            .key(&keys.queue)
            .key(&keys.shared_parent)
            .key(&keys.env_parent)
            .key(&keys.message)
            .arg(&keys.queue)
            .arg(message_id)
            .arg(payload)
            .arg(score_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn dequeue(
        &self,
        keys: &DequeueKeys,
        visibility_timeout_ms: i64,
        now_ms: i64,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<Option<DequeuedHead>> {
        let mut conn = self.conn().await?;
        let claimed: Option<(String, String)> = self
            .scripts
            .dequeue
            .key(&keys.queue)
            .key(&keys.shared_parent)
            .key(&keys.env_parent)
            .key(&keys.visibility)
            .key(&keys.queue_concurrency_limit)
            .key(&keys.env_concurrency_limit)
            .key(&keys.org_concurrency_limit)
            .key(&keys.queue_current_concurrency)
            .key(&keys.env_current_concurrency)
            .key(&keys.org_current_concurrency)
            .arg(&keys.queue)
            .arg(visibility_timeout_ms)
            .arg(now_ms)
            .arg(defaults.queue)
            .arg(defaults.env)
            .arg(defaults.org)
            .invoke_async(&mut *conn)
            .await?;

        match claimed {
            None => Ok(None),
            Some((message_id, raw_score)) => {
                let score = raw_score.parse::<f64>().map_err(|_| {
                    MarqsError::Internal(format!(
                        "dequeue returned a non-numeric score: {raw_score:?}"
                    ))
                })? as i64;
                Ok(Some(DequeuedHead { message_id, score }))
            }
        }
    }

    async fn ack(&self, keys: &AckKeys, message_id: &str) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: () = self
            .scripts
            .ack
            .key(&keys.message)
            .key(&keys.visibility)
            .key(&keys.queue_current_concurrency)
            .key(&keys.env_current_concurrency)
            .key(&keys.org_current_concurrency)
            .arg(message_id)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, keys: &NackKeys, message_id: &str, score_ms: i64) -> MarqsResult<bool> {
        let mut conn = self.conn().await?;
        let requeued: i64 = self
            .scripts
            .nack
            .key(&keys.queue)
            .key(&keys.shared_parent)
            .key(&keys.env_parent)
            .key(&keys.visibility)
            .key(&keys.queue_current_concurrency)
            .key(&keys.env_current_concurrency)
            .key(&keys.org_current_concurrency)
            .arg(&keys.queue)
            .arg(message_id)
            .arg(score_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn heartbeat(
        &self,
        visibility_key: &str,
        message_id: &str,
        extension_ms: i64,
        max_deadline_ms: i64,
    ) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = self
            .scripts
            .heartbeat
            .key(visibility_key)
            .arg(message_id)
            .arg(extension_ms)
            .arg(max_deadline_ms)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn compute_capacities(
        &self,
        keys: &CapacityKeys,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<QueueCapacities> {
        let mut conn = self.conn().await?;
        let (queue_current, queue_limit, env_current, env_limit, org_current, org_limit): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
        ) = self
            .scripts
            .compute_capacities
            .key(&keys.queue_current_concurrency)
            .key(&keys.env_current_concurrency)
            .key(&keys.org_current_concurrency)
            .key(&keys.queue_concurrency_limit)
            .key(&keys.env_concurrency_limit)
            .key(&keys.org_concurrency_limit)
            .arg(defaults.queue)
            .arg(defaults.env)
            .arg(defaults.org)
            .invoke_async(&mut *conn)
            .await?;

        Ok(QueueCapacities {
            queue: Capacity {
                current: queue_current,
                limit: queue_limit,
            },
            env: Capacity {
                current: env_current,
                limit: env_limit,
            },
            org: Capacity {
                current: org_current,
                limit: org_limit,
            },
        })
    }

    async fn update_global_limits(
        &self,
        env_limit_key: &str,
        org_limit_key: &str,
        env_limit: u64,
        org_limit: u64,
    ) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: () = self
            .scripts
            .update_global_limits
            .key(env_limit_key)
            .key(org_limit_key)
            .arg(env_limit)
            .arg(org_limit)
            .invoke_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_concurrency_limit(&self, limit_key: &str, limit: u64) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(limit_key, limit).await?;
        Ok(())
    }

    async fn read_message(&self, message_key: &str) -> MarqsResult<Option<String>> {
        let mut conn = self.conn().await?;
        let body: Option<String> = conn.get(message_key).await?;
        Ok(body)
    }

    async fn parent_queue_range(
        &self,
        parent_key: &str,
        start: usize,
        stop: usize,
    ) -> MarqsResult<Vec<(String, i64)>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = conn
            .zrange_withscores(parent_key, start as isize, stop as isize)
            .await?;
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn visibility_due(
        &self,
        visibility_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> MarqsResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let due: Vec<String> = conn
            .zrangebyscore_limit(visibility_key, 0, now_ms, 0, limit as isize)
            .await?;
        Ok(due)
    }

    async fn remove_from_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
    ) -> MarqsResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.zrem(visibility_key, message_id).await?;
        Ok(())
    }
}
