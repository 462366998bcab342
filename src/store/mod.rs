//! Store abstraction: the atomic script boundary.
//!
//! Every multi-key state change goes through one [`QueueStore`] method, and
//! every method is atomic with respect to all others — on Redis each is a
//! single server-side Lua script, in memory each runs under one mutex. The
//! cross-structure invariants (a message id lives in exactly one of its
//! child queue or the visibility ZSET, parents always index the minimum
//! child score, in-flight ids appear in all three concurrency sets) only
//! hold because of this boundary; splitting a method into several round
//! trips would break them under concurrent callers.
//!
//! Key strings are produced by the caller (via [`crate::keys::KeyProducer`])
//! and handed over in per-operation bundles so each backend stays a dumb
//! executor.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::MarqsResult;

pub use self::memory::{MemoryStore, StoreSnapshot};
pub use self::redis::RedisStore;

/// One concurrency ceiling: how many messages are in flight vs allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub current: u64,
    pub limit: u64,
}

impl Capacity {
    /// Remaining headroom; negative when a limit was lowered below the
    /// number already in flight.
    pub fn available(&self) -> i64 {
        self.limit as i64 - self.current as i64
    }
}

/// The three nested ceilings guarding one child queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCapacities {
    pub queue: Capacity,
    pub env: Capacity,
    pub org: Capacity,
}

impl QueueCapacities {
    /// Headroom of the tightest ceiling.
    pub fn available(&self) -> i64 {
        self.queue
            .available()
            .min(self.env.available())
            .min(self.org.available())
    }
}

/// Fallback ceilings applied when a limit key is absent.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyDefaults {
    pub queue: u64,
    pub env: u64,
    pub org: u64,
}

/// Head of a child queue claimed by a dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedHead {
    pub message_id: String,
    /// The message's original enqueue score.
    pub score: i64,
}

/// Keys touched by the enqueue script.
///
/// A child queue is indexed in both the global and the env-scoped parent so
/// either dequeue path can find it; both parents are rebalanced on every
/// child mutation.
#[derive(Debug, Clone)]
pub struct EnqueueKeys {
    pub queue: String,
    pub shared_parent: String,
    pub env_parent: String,
    pub message: String,
}

/// Keys touched by the dequeue script.
#[derive(Debug, Clone)]
pub struct DequeueKeys {
    pub queue: String,
    pub shared_parent: String,
    pub env_parent: String,
    pub visibility: String,
    pub queue_concurrency_limit: String,
    pub env_concurrency_limit: String,
    pub org_concurrency_limit: String,
    pub queue_current_concurrency: String,
    pub env_current_concurrency: String,
    pub org_current_concurrency: String,
}

/// Keys touched by the ack script.
#[derive(Debug, Clone)]
pub struct AckKeys {
    pub message: String,
    pub visibility: String,
    pub queue_current_concurrency: String,
    pub env_current_concurrency: String,
    pub org_current_concurrency: String,
}

/// Keys touched by the nack script.
#[derive(Debug, Clone)]
pub struct NackKeys {
    pub queue: String,
    pub shared_parent: String,
    pub env_parent: String,
    pub visibility: String,
    pub queue_current_concurrency: String,
    pub env_current_concurrency: String,
    pub org_current_concurrency: String,
}

/// Keys read by the capacity probe.
#[derive(Debug, Clone)]
pub struct CapacityKeys {
    pub queue_current_concurrency: String,
    pub env_current_concurrency: String,
    pub org_current_concurrency: String,
    pub queue_concurrency_limit: String,
    pub env_concurrency_limit: String,
    pub org_concurrency_limit: String,
}

/// Sorted-set store executing the broker's atomic operations.
///
/// Implementations: [`RedisStore`] (production, Lua scripts over a pooled
/// connection) and [`MemoryStore`] (development and tests, one mutex).
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Write the body, insert the id into the child queue at `score_ms`,
    /// rebalance both parents.
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        message_id: &str,
        payload: &str,
        score_ms: i64,
    ) -> MarqsResult<()>;

    /// Claim the oldest due message if every ceiling has headroom: remove
    /// it from the child queue, lease it in the visibility ZSET until
    /// `now_ms + visibility_timeout_ms`, mark it in all three concurrency
    /// sets, rebalance both parents. Ceilings are checked org, env, queue.
    async fn dequeue(
        &self,
        keys: &DequeueKeys,
        visibility_timeout_ms: i64,
        now_ms: i64,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<Option<DequeuedHead>>;

    /// Delete the body and clear the id from the visibility ZSET and all
    /// three concurrency sets. Idempotent over missing keys.
    async fn ack(&self, keys: &AckKeys, message_id: &str) -> MarqsResult<()>;

    /// Return an in-flight message to its child queue at `score_ms` (which
    /// may be in the future, implementing retry backoff). Returns `false`
    /// without touching anything when the id is not leased — the caller
    /// lost a race to an ack or an earlier nack.
    async fn nack(&self, keys: &NackKeys, message_id: &str, score_ms: i64) -> MarqsResult<bool>;

    /// Extend an in-flight lease to
    /// `min(current + extension_ms, max_deadline_ms)`. No-op when the id is
    /// not leased.
    async fn heartbeat(
        &self,
        visibility_key: &str,
        message_id: &str,
        extension_ms: i64,
        max_deadline_ms: i64,
    ) -> MarqsResult<()>;

    /// Read the six (current, limit) numbers for one child queue.
    async fn compute_capacities(
        &self,
        keys: &CapacityKeys,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<QueueCapacities>;

    /// Set the env and org ceilings in one shot.
    async fn update_global_limits(
        &self,
        env_limit_key: &str,
        org_limit_key: &str,
        env_limit: u64,
        org_limit: u64,
    ) -> MarqsResult<()>;

    /// Set a single concurrency ceiling.
    async fn set_concurrency_limit(&self, limit_key: &str, limit: u64) -> MarqsResult<()>;

    /// Read a message body. Plain read; no atomicity needed.
    async fn read_message(&self, message_key: &str) -> MarqsResult<Option<String>>;

    /// Read parent members with scores over an inclusive index range,
    /// ascending score order.
    async fn parent_queue_range(
        &self,
        parent_key: &str,
        start: usize,
        stop: usize,
    ) -> MarqsResult<Vec<(String, i64)>>;

    /// Ids in the visibility ZSET whose deadline is at or before `now_ms`,
    /// oldest first, at most `limit`.
    async fn visibility_due(
        &self,
        visibility_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> MarqsResult<Vec<String>>;

    /// Drop one id from the visibility ZSET (used for garbled or orphaned
    /// bodies, to break tight redelivery loops).
    async fn remove_from_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
    ) -> MarqsResult<()>;
}
