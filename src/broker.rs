//! The broker: public operations over the queue store.
//!
//! `Marqs` owns no threads beyond its requeue workers; all other
//! concurrency comes from concurrent callers. The only suspension points
//! are the store round-trips, and the store's script boundary is the only
//! serialization mechanism — the broker itself holds no locks around its
//! operations.

use std::sync::{Arc, Mutex};

use tracing::{error, Instrument, Span};

use crate::config::MarqsConfig;
use crate::error::MarqsResult;
use crate::keys::{DefaultKeyProducer, KeyProducer, TenantEnvironment};
use crate::message::{MessagePayload, PAYLOAD_VERSION};
use crate::requeuer::Requeuer;
use crate::store::{
    AckKeys, CapacityKeys, ConcurrencyDefaults, DequeueKeys, EnqueueKeys, NackKeys, QueueStore,
    RedisStore,
};
use crate::strategy::{QueueCandidate, QueuePriorityStrategy, SimpleWeightedChoiceStrategy};
use crate::telemetry;

/// Current time in epoch milliseconds; the scale every score and deadline
/// uses.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Multitenant message broker over a sorted-set store.
///
/// Construction starts the requeue workers; call [`Marqs::shutdown`] on
/// teardown to stop them (dropping the broker signals them as a fallback).
pub struct Marqs {
    config: MarqsConfig,
    store: Arc<dyn QueueStore>,
    keys: Arc<dyn KeyProducer>,
    shared_strategy: Box<dyn QueuePriorityStrategy>,
    env_strategy: Box<dyn QueuePriorityStrategy>,
    requeuer: Mutex<Option<Requeuer>>,
}

impl Marqs {
    pub fn builder(config: MarqsConfig) -> MarqsBuilder {
        MarqsBuilder::new(config)
    }

    fn defaults(&self) -> ConcurrencyDefaults {
        ConcurrencyDefaults {
            queue: self.config.default_queue_concurrency,
            env: self.config.default_env_concurrency,
            org: self.config.default_org_concurrency,
        }
    }

    /// Publish a message onto `(env, queue)`, optionally sharded by a
    /// concurrency key. The current trace context is injected into `data`
    /// so the eventual consumer can parent its span on the producer's.
    pub async fn enqueue(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        message_id: &str,
        data: serde_json::Value,
        concurrency_key: Option<&str>,
    ) -> MarqsResult<()> {
        let queue_key = self.keys.queue_key(env, queue, concurrency_key);
        let shared_parent = self.keys.shared_queue_key();
        let env_parent = self.keys.env_shared_queue_key(env);
        let span = telemetry::publish_span(&queue_key, &shared_parent, message_id, concurrency_key);

        let result = async {
            let mut data = data;
            telemetry::inject_trace_context(&mut data);

            let timestamp = now_ms();
            let payload = MessagePayload {
                version: PAYLOAD_VERSION.to_string(),
                data,
                queue: queue_key.clone(),
                concurrency_key: concurrency_key.map(str::to_string),
                timestamp,
                message_id: message_id.to_string(),
                parent_queue: shared_parent.clone(),
            };
            let serialized = serde_json::to_string(&payload)?;

            let keys = EnqueueKeys {
                queue: queue_key.clone(),
                shared_parent,
                env_parent,
                message: self.keys.message_key(message_id),
            };
            self.store
                .enqueue(&keys, message_id, &serialized, timestamp)
                .await
        }
        .instrument(span.clone())
        .await;

        if let Err(ref e) = result {
            telemetry::record_failure(&span, e);
        }
        result
    }

    /// Try to claim one message from any queue under the environment's
    /// parent. `None` means no work (or no headroom) right now; poll again
    /// later.
    pub async fn dequeue_from_env(
        &self,
        env: &TenantEnvironment,
    ) -> MarqsResult<Option<MessagePayload>> {
        let parent = self.keys.env_shared_queue_key(env);
        self.dequeue_from_parent(&parent, self.env_strategy.as_ref())
            .await
    }

    /// Try to claim one message from any queue under the global parent.
    pub async fn dequeue_from_shared(&self) -> MarqsResult<Option<MessagePayload>> {
        let parent = self.keys.shared_queue_key();
        self.dequeue_from_parent(&parent, self.shared_strategy.as_ref())
            .await
    }

    async fn dequeue_from_parent(
        &self,
        parent: &str,
        strategy: &dyn QueuePriorityStrategy,
    ) -> MarqsResult<Option<MessagePayload>> {
        let span = telemetry::receive_span(parent);

        let result = async {
            let Some(queue_key) = self.random_queue_from_parent(parent, strategy).await? else {
                telemetry::mark_aborted(&Span::current());
                return Ok(None);
            };
            Span::current().record("marqs.queue", queue_key.as_str());

            let keys = DequeueKeys {
                queue: queue_key.clone(),
                shared_parent: self.keys.shared_queue_key(),
                env_parent: self.keys.env_shared_queue_key_from_queue(&queue_key),
                visibility: self.keys.visibility_queue_key(),
                queue_concurrency_limit: self.keys.concurrency_limit_key_from_queue(&queue_key),
                env_concurrency_limit: self.keys.env_concurrency_limit_key_from_queue(&queue_key),
                org_concurrency_limit: self.keys.org_concurrency_limit_key_from_queue(&queue_key),
                queue_current_concurrency: self
                    .keys
                    .current_concurrency_key_from_queue(&queue_key),
                env_current_concurrency: self
                    .keys
                    .env_current_concurrency_key_from_queue(&queue_key),
                org_current_concurrency: self
                    .keys
                    .org_current_concurrency_key_from_queue(&queue_key),
            };

            let Some(head) = self
                .store
                .dequeue(
                    &keys,
                    self.config.visibility_timeout_ms,
                    now_ms(),
                    self.defaults(),
                )
                .await?
            else {
                // Lost the capacity race between selection and claim.
                telemetry::mark_aborted(&Span::current());
                return Ok(None);
            };

            Span::current().record("messaging.message_id", head.message_id.as_str());
            Span::current().record("marqs.messageId", head.message_id.as_str());

            let message_key = self.keys.message_key(&head.message_id);
            let Some(raw) = self.store.read_message(&message_key).await? else {
                error!(
                    message_id = %head.message_id,
                    queue = %queue_key,
                    "dequeued a message with no body"
                );
                return Ok(None);
            };

            match serde_json::from_str::<MessagePayload>(&raw) {
                Ok(payload) => Ok(Some(payload)),
                Err(e) => {
                    error!(
                        message_id = %head.message_id,
                        queue = %queue_key,
                        error = %e,
                        "dequeued message body failed to parse"
                    );
                    Ok(None)
                }
            }
        }
        .instrument(span.clone())
        .await;

        if let Err(ref e) = result {
            telemetry::record_failure(&span, e);
        }
        result
    }

    /// Pull the strategy's candidate window out of the parent, price each
    /// candidate's headroom, and let the strategy pick.
    async fn random_queue_from_parent(
        &self,
        parent: &str,
        strategy: &dyn QueuePriorityStrategy,
    ) -> MarqsResult<Option<String>> {
        let selection = strategy.next_candidate_selection(parent);
        let (start, stop) = selection.range;

        let members = self.store.parent_queue_range(parent, start, stop).await?;

        let span = Span::current();
        let next_range = format!("{start}-{stop}");
        span.record("marqs.nextRange", next_range.as_str());
        span.record("marqs.queueCount", members.len() as u64);

        if members.is_empty() {
            return Ok(None);
        }

        let now = now_ms();
        let mut candidates = Vec::with_capacity(members.len());
        for (queue, score) in &members {
            let capacity_keys = CapacityKeys {
                queue_current_concurrency: self.keys.current_concurrency_key_from_queue(queue),
                env_current_concurrency: self.keys.env_current_concurrency_key_from_queue(queue),
                org_current_concurrency: self.keys.org_current_concurrency_key_from_queue(queue),
                queue_concurrency_limit: self.keys.concurrency_limit_key_from_queue(queue),
                env_concurrency_limit: self.keys.env_concurrency_limit_key_from_queue(queue),
                org_concurrency_limit: self.keys.org_concurrency_limit_key_from_queue(queue),
            };
            let capacities = self
                .store
                .compute_capacities(&capacity_keys, self.defaults())
                .await?;
            candidates.push(QueueCandidate {
                queue: queue.clone(),
                age_ms: now - score,
                capacities,
            });
        }

        let queues = members
            .iter()
            .map(|(queue, _)| queue.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let queues_with_scores = members
            .iter()
            .map(|(queue, score)| format!("{queue}={score}"))
            .collect::<Vec<_>>()
            .join(",");
        span.record("marqs.queues", queues.as_str());
        span.record("marqs.queuesWithScores", queues_with_scores.as_str());

        let choice = strategy.choose_queue(&candidates, parent, &selection.selection_id);
        if let Some(queue) = &choice {
            span.record("marqs.queueChoice", queue.as_str());
        }
        Ok(choice)
    }

    /// Destroy a message and release its lease and concurrency slots.
    /// Unknown ids are a no-op.
    pub async fn acknowledge(&self, message_id: &str) -> MarqsResult<()> {
        let span = telemetry::ack_span(message_id);

        let result = async {
            let message_key = self.keys.message_key(message_id);
            let Some(raw) = self.store.read_message(&message_key).await? else {
                return Ok(());
            };
            let payload: MessagePayload = match serde_json::from_str(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        error = %e,
                        "cannot ack a message with an unparsable body"
                    );
                    return Ok(());
                }
            };
            Span::current().record("marqs.queue", payload.queue.as_str());

            let keys = AckKeys {
                message: message_key,
                visibility: self.keys.visibility_queue_key(),
                queue_current_concurrency: self
                    .keys
                    .current_concurrency_key_from_queue(&payload.queue),
                env_current_concurrency: self
                    .keys
                    .env_current_concurrency_key_from_queue(&payload.queue),
                org_current_concurrency: self
                    .keys
                    .org_current_concurrency_key_from_queue(&payload.queue),
            };
            self.store.ack(&keys, message_id).await
        }
        .instrument(span.clone())
        .await;

        if let Err(ref e) = result {
            telemetry::record_failure(&span, e);
        }
        result
    }

    /// Return an in-flight message to its queue. With `retry_at_ms` in the
    /// future the message will not redeliver until that time. Loses
    /// gracefully against a concurrent ack or earlier nack.
    pub async fn nack(&self, message_id: &str, retry_at_ms: Option<i64>) -> MarqsResult<()> {
        let span = telemetry::nack_span(message_id);

        let result = async {
            let message_key = self.keys.message_key(message_id);
            let Some(raw) = self.store.read_message(&message_key).await? else {
                return Ok(());
            };
            let payload: MessagePayload = match serde_json::from_str(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        error = %e,
                        "cannot nack a message with an unparsable body"
                    );
                    return Ok(());
                }
            };
            Span::current().record("marqs.queue", payload.queue.as_str());

            let keys = NackKeys {
                queue: payload.queue.clone(),
                shared_parent: self.keys.shared_queue_key(),
                env_parent: self.keys.env_shared_queue_key_from_queue(&payload.queue),
                visibility: self.keys.visibility_queue_key(),
                queue_current_concurrency: self
                    .keys
                    .current_concurrency_key_from_queue(&payload.queue),
                env_current_concurrency: self
                    .keys
                    .env_current_concurrency_key_from_queue(&payload.queue),
                org_current_concurrency: self
                    .keys
                    .org_current_concurrency_key_from_queue(&payload.queue),
            };
            let score = retry_at_ms.unwrap_or_else(now_ms);
            self.store.nack(&keys, message_id, score).await.map(|_| ())
        }
        .instrument(span.clone())
        .await;

        if let Err(ref e) = result {
            telemetry::record_failure(&span, e);
        }
        result
    }

    /// Rewrite a message's body in place: ack, then enqueue under the same
    /// id, queue, parent and concurrency key with a fresh timestamp
    /// (defaulting to now).
    ///
    /// The two steps are individually atomic but not fused; between them
    /// the id briefly has no body. Callers get eventual consistency only.
    pub async fn replace(
        &self,
        message_id: &str,
        data: serde_json::Value,
        timestamp_ms: Option<i64>,
    ) -> MarqsResult<()> {
        let span = telemetry::replace_span(message_id);

        let result = async {
            let message_key = self.keys.message_key(message_id);
            let Some(raw) = self.store.read_message(&message_key).await? else {
                return Ok(());
            };
            let payload: MessagePayload = match serde_json::from_str(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(
                        message_id = %message_id,
                        error = %e,
                        "cannot replace a message with an unparsable body"
                    );
                    return Ok(());
                }
            };
            Span::current().record("marqs.queue", payload.queue.as_str());

            let ack_keys = AckKeys {
                message: message_key.clone(),
                visibility: self.keys.visibility_queue_key(),
                queue_current_concurrency: self
                    .keys
                    .current_concurrency_key_from_queue(&payload.queue),
                env_current_concurrency: self
                    .keys
                    .env_current_concurrency_key_from_queue(&payload.queue),
                org_current_concurrency: self
                    .keys
                    .org_current_concurrency_key_from_queue(&payload.queue),
            };
            self.store.ack(&ack_keys, message_id).await?;

            let mut data = data;
            telemetry::inject_trace_context(&mut data);
            let timestamp = timestamp_ms.unwrap_or_else(now_ms);
            let replacement = MessagePayload {
                version: PAYLOAD_VERSION.to_string(),
                data,
                queue: payload.queue.clone(),
                concurrency_key: payload.concurrency_key.clone(),
                timestamp,
                message_id: message_id.to_string(),
                parent_queue: payload.parent_queue.clone(),
            };
            let serialized = serde_json::to_string(&replacement)?;

            let enqueue_keys = EnqueueKeys {
                queue: payload.queue.clone(),
                shared_parent: self.keys.shared_queue_key(),
                env_parent: self.keys.env_shared_queue_key_from_queue(&payload.queue),
                message: message_key,
            };
            self.store
                .enqueue(&enqueue_keys, message_id, &serialized, timestamp)
                .await
        }
        .instrument(span.clone())
        .await;

        if let Err(ref e) = result {
            telemetry::record_failure(&span, e);
        }
        result
    }

    /// Extend an in-flight lease by `seconds`, clamped to one full
    /// visibility timeout past now. Repeated heartbeats can therefore keep
    /// extending a lease indefinitely. Unknown ids are a no-op.
    pub async fn heartbeat(&self, message_id: &str, seconds: i64) -> MarqsResult<()> {
        let now = now_ms();
        self.store
            .heartbeat(
                &self.keys.visibility_queue_key(),
                message_id,
                seconds * 1000,
                now + self.config.visibility_timeout_ms,
            )
            .await
    }

    /// Set the concurrency ceiling for one queue. Concurrency-keyed
    /// subqueues share this ceiling.
    pub async fn update_queue_concurrency_limit(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        limit: u64,
    ) -> MarqsResult<()> {
        self.store
            .set_concurrency_limit(&self.keys.concurrency_limit_key(env, queue), limit)
            .await
    }

    /// Push the tenant-configured env and org ceilings down to the store.
    pub async fn update_env_concurrency_limits(
        &self,
        env: &TenantEnvironment,
    ) -> MarqsResult<()> {
        self.store
            .update_global_limits(
                &self.keys.env_concurrency_limit_key(env),
                &self.keys.org_concurrency_limit_key(env),
                env.env_concurrency_limit,
                env.org_concurrency_limit,
            )
            .await
    }

    /// Stop the requeue workers and wait for them to finish.
    pub async fn shutdown(&self) {
        let requeuer = self
            .requeuer
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(requeuer) = requeuer {
            requeuer.stop().await;
        }
    }
}

impl Drop for Marqs {
    fn drop(&mut self) {
        // Best effort when shutdown() was never called; Drop cannot await
        // the workers.
        if let Ok(guard) = self.requeuer.lock() {
            if let Some(requeuer) = guard.as_ref() {
                requeuer.signal_shutdown();
            }
        }
    }
}

/// Assembles a broker, connecting to Redis unless a store is injected.
pub struct MarqsBuilder {
    config: MarqsConfig,
    store: Option<Arc<dyn QueueStore>>,
    key_producer: Option<Arc<dyn KeyProducer>>,
    shared_strategy: Option<Box<dyn QueuePriorityStrategy>>,
    env_strategy: Option<Box<dyn QueuePriorityStrategy>>,
}

impl MarqsBuilder {
    pub fn new(config: MarqsConfig) -> Self {
        Self {
            config,
            store: None,
            key_producer: None,
            shared_strategy: None,
            env_strategy: None,
        }
    }

    /// Use a custom store (e.g. [`crate::store::MemoryStore`] in tests).
    pub fn store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn key_producer(mut self, keys: Arc<dyn KeyProducer>) -> Self {
        self.key_producer = Some(keys);
        self
    }

    pub fn shared_strategy(mut self, strategy: Box<dyn QueuePriorityStrategy>) -> Self {
        self.shared_strategy = Some(strategy);
        self
    }

    pub fn env_strategy(mut self, strategy: Box<dyn QueuePriorityStrategy>) -> Self {
        self.env_strategy = Some(strategy);
        self
    }

    pub async fn build(self) -> MarqsResult<Marqs> {
        let store: Arc<dyn QueueStore> = match self.store {
            Some(store) => store,
            None => Arc::new(RedisStore::connect(&self.config).await?),
        };
        let keys: Arc<dyn KeyProducer> = self
            .key_producer
            .unwrap_or_else(|| Arc::new(DefaultKeyProducer::new(self.config.key_prefix.clone())));
        let shared_strategy = self
            .shared_strategy
            .unwrap_or_else(|| Box::new(SimpleWeightedChoiceStrategy::default()));
        let env_strategy = self
            .env_strategy
            .unwrap_or_else(|| Box::new(SimpleWeightedChoiceStrategy::default()));

        let requeuer = Requeuer::start(store.clone(), keys.clone(), &self.config);

        Ok(Marqs {
            config: self.config,
            store,
            keys,
            shared_strategy,
            env_strategy,
            requeuer: Mutex::new(Some(requeuer)),
        })
    }
}
