//! In-process store for development and tests.
//!
//! Implements every [`QueueStore`] method with the same pre/post semantics
//! as the Lua scripts in [`super::redis::scripts`], under a single mutex so
//! each method is atomic exactly like a server-side script. Sorted sets are
//! ordered by `(score, member)` — ascending score, lexicographic members on
//! score ties — matching Redis ZSET iteration order.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::MarqsResult;

use super::{
    AckKeys, Capacity, CapacityKeys, ConcurrencyDefaults, DequeueKeys, DequeuedHead, EnqueueKeys,
    NackKeys, QueueCapacities, QueueStore,
};

type ZSet = HashMap<String, i64>;

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    zsets: HashMap<String, ZSet>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn zadd(&mut self, key: &str, member: &str, score: i64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn zrem(&mut self, key: &str, member: &str) {
        if let Some(zset) = self.zsets.get_mut(key) {
            zset.remove(member);
            if zset.is_empty() {
                self.zsets.remove(key);
            }
        }
    }

    fn zscore(&self, key: &str, member: &str) -> Option<i64> {
        self.zsets.get(key).and_then(|z| z.get(member)).copied()
    }

    fn scard(&self, key: &str) -> u64 {
        self.sets.get(key).map(|s| s.len() as u64).unwrap_or(0)
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn srem(&mut self, key: &str, member: &str) {
        if let Some(set) = self.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                self.sets.remove(key);
            }
        }
    }

    fn limit(&self, key: &str, default: u64) -> u64 {
        self.strings
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Members sorted the way Redis iterates a ZSET.
    fn zentries(&self, key: &str) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    fn zset_min(&self, key: &str) -> Option<(String, i64)> {
        self.zentries(key).into_iter().next()
    }

    /// Upsert the child's minimum score in a parent, or remove the child
    /// when it is empty. Mirrors the rebalance block every Lua script ends
    /// with.
    fn rebalance_parent(&mut self, parent_key: &str, child_key: &str) {
        match self.zset_min(child_key) {
            Some((_, min_score)) => self.zadd(parent_key, child_key, min_score),
            None => self.zrem(parent_key, child_key),
        }
    }

    fn capacities(&self, keys: &CapacityKeys, defaults: ConcurrencyDefaults) -> QueueCapacities {
        QueueCapacities {
            queue: Capacity {
                current: self.scard(&keys.queue_current_concurrency),
                limit: self.limit(&keys.queue_concurrency_limit, defaults.queue),
            },
            env: Capacity {
                current: self.scard(&keys.env_current_concurrency),
                limit: self.limit(&keys.env_concurrency_limit, defaults.env),
            },
            org: Capacity {
                current: self.scard(&keys.org_current_concurrency),
                limit: self.limit(&keys.org_concurrency_limit, defaults.org),
            },
        }
    }
}

/// Mutex-serialized store; safe to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

/// Point-in-time copy of everything in the store, for inspection in tests
/// and debugging. ZSET entries come out in `(score, member)` order.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub strings: HashMap<String, String>,
    pub zsets: HashMap<String, Vec<(String, i64)>>,
    pub sets: HashMap<String, HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked mid-op;
        // the state itself is still structurally sound.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state();
        StoreSnapshot {
            strings: state.strings.clone(),
            zsets: state
                .zsets
                .keys()
                .map(|key| (key.clone(), state.zentries(key)))
                .collect(),
            sets: state.sets.clone(),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(
        &self,
        keys: &EnqueueKeys,
        message_id: &str,
        payload: &str,
        score_ms: i64,
    ) -> MarqsResult<()> {
        let mut state = self.state();
        state
            .strings
            .insert(keys.message.clone(), payload.to_string());
        state.zadd(&keys.queue, message_id, score_ms);
        state.rebalance_parent(&keys.shared_parent, &keys.queue);
        state.rebalance_parent(&keys.env_parent, &keys.queue);
        Ok(())
    }

    async fn dequeue(
        &self,
        keys: &DequeueKeys,
        visibility_timeout_ms: i64,
        now_ms: i64,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<Option<DequeuedHead>> {
        let mut state = self.state();

        // Ceilings are probed org, env, queue — outermost first.
        let org_current = state.scard(&keys.org_current_concurrency);
        if org_current >= state.limit(&keys.org_concurrency_limit, defaults.org) {
            return Ok(None);
        }
        let env_current = state.scard(&keys.env_current_concurrency);
        if env_current >= state.limit(&keys.env_concurrency_limit, defaults.env) {
            return Ok(None);
        }
        let queue_current = state.scard(&keys.queue_current_concurrency);
        if queue_current >= state.limit(&keys.queue_concurrency_limit, defaults.queue) {
            return Ok(None);
        }

        let Some((message_id, score)) = state
            .zentries(&keys.queue)
            .into_iter()
            .find(|(_, s)| *s <= now_ms)
        else {
            return Ok(None);
        };

        state.zrem(&keys.queue, &message_id);
        state.zadd(
            &keys.visibility,
            &message_id,
            now_ms + visibility_timeout_ms,
        );
        state.sadd(&keys.queue_current_concurrency, &message_id);
        state.sadd(&keys.env_current_concurrency, &message_id);
        state.sadd(&keys.org_current_concurrency, &message_id);
        state.rebalance_parent(&keys.shared_parent, &keys.queue);
        state.rebalance_parent(&keys.env_parent, &keys.queue);

        Ok(Some(DequeuedHead { message_id, score }))
    }

    async fn ack(&self, keys: &AckKeys, message_id: &str) -> MarqsResult<()> {
        let mut state = self.state();
        state.strings.remove(&keys.message);
        state.zrem(&keys.visibility, message_id);
        state.srem(&keys.queue_current_concurrency, message_id);
        state.srem(&keys.env_current_concurrency, message_id);
        state.srem(&keys.org_current_concurrency, message_id);
        Ok(())
    }

    async fn nack(&self, keys: &NackKeys, message_id: &str, score_ms: i64) -> MarqsResult<bool> {
        let mut state = self.state();

        // Membership in the visibility ZSET is the race guard: an id that
        // was already ack'd (or nack'd) is left alone.
        if state.zscore(&keys.visibility, message_id).is_none() {
            return Ok(false);
        }

        state.zrem(&keys.visibility, message_id);
        state.srem(&keys.queue_current_concurrency, message_id);
        state.srem(&keys.env_current_concurrency, message_id);
        state.srem(&keys.org_current_concurrency, message_id);
        state.zadd(&keys.queue, message_id, score_ms);
        state.rebalance_parent(&keys.shared_parent, &keys.queue);
        state.rebalance_parent(&keys.env_parent, &keys.queue);
        Ok(true)
    }

    async fn heartbeat(
        &self,
        visibility_key: &str,
        message_id: &str,
        extension_ms: i64,
        max_deadline_ms: i64,
    ) -> MarqsResult<()> {
        let mut state = self.state();
        if let Some(current) = state.zscore(visibility_key, message_id) {
            let new_deadline = (current + extension_ms).min(max_deadline_ms);
            state.zadd(visibility_key, message_id, new_deadline);
        }
        Ok(())
    }

    async fn compute_capacities(
        &self,
        keys: &CapacityKeys,
        defaults: ConcurrencyDefaults,
    ) -> MarqsResult<QueueCapacities> {
        Ok(self.state().capacities(keys, defaults))
    }

    async fn update_global_limits(
        &self,
        env_limit_key: &str,
        org_limit_key: &str,
        env_limit: u64,
        org_limit: u64,
    ) -> MarqsResult<()> {
        let mut state = self.state();
        state
            .strings
            .insert(env_limit_key.to_string(), env_limit.to_string());
        state
            .strings
            .insert(org_limit_key.to_string(), org_limit.to_string());
        Ok(())
    }

    async fn set_concurrency_limit(&self, limit_key: &str, limit: u64) -> MarqsResult<()> {
        self.state()
            .strings
            .insert(limit_key.to_string(), limit.to_string());
        Ok(())
    }

    async fn read_message(&self, message_key: &str) -> MarqsResult<Option<String>> {
        Ok(self.state().strings.get(message_key).cloned())
    }

    async fn parent_queue_range(
        &self,
        parent_key: &str,
        start: usize,
        stop: usize,
    ) -> MarqsResult<Vec<(String, i64)>> {
        let entries = self.state().zentries(parent_key);
        Ok(entries
            .into_iter()
            .skip(start)
            .take(stop.saturating_sub(start) + 1)
            .collect())
    }

    async fn visibility_due(
        &self,
        visibility_key: &str,
        now_ms: i64,
        limit: usize,
    ) -> MarqsResult<Vec<String>> {
        let entries = self.state().zentries(visibility_key);
        Ok(entries
            .into_iter()
            .filter(|(_, score)| *score <= now_ms)
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn remove_from_visibility(
        &self,
        visibility_key: &str,
        message_id: &str,
    ) -> MarqsResult<()> {
        self.state().zrem(visibility_key, message_id);
        Ok(())
    }
}
