//! MarQS — multitenant asynchronous reliable queueing.
//!
//! A fair-share, concurrency-bounded message broker dispatching background
//! work across many tenants on top of a Redis sorted-set keyspace. It
//! provides at-least-once delivery with a visibility-timeout redelivery
//! model, enforces three nested concurrency ceilings (queue, environment,
//! organization), and selects work from a very large queue population with
//! a weighted, age-aware strategy.
//!
//! # Layout
//!
//! - A "queue of queues": each child queue is a ZSET of message ids scored
//!   by enqueue time; parents are ZSETs of child keys scored by each
//!   child's oldest message.
//! - All multi-key transitions run as single atomic store operations (Lua
//!   scripts on Redis, one mutex in the in-memory store).
//! - In-flight messages live in a visibility ZSET; requeue workers return
//!   expired leases to their queues.
//!
//! # Example
//!
//! ```rust,ignore
//! use marqs::{Marqs, MarqsConfig, MemoryStore, TenantEnvironment};
//! use std::sync::Arc;
//!
//! let broker = Marqs::builder(MarqsConfig::default())
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()
//!     .await?;
//!
//! let env = TenantEnvironment {
//!     id: "env_1".into(),
//!     organization_id: "org_1".into(),
//!     env_concurrency_limit: 100,
//!     org_concurrency_limit: 300,
//! };
//!
//! broker.enqueue(&env, "emails", "msg_1", serde_json::json!({"to": "a"}), None).await?;
//! if let Some(message) = broker.dequeue_from_env(&env).await? {
//!     // ... process ...
//!     broker.acknowledge(&message.message_id).await?;
//! }
//! broker.shutdown().await;
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod global;
pub mod keys;
pub mod message;
mod requeuer;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use broker::{Marqs, MarqsBuilder};
pub use config::{MarqsConfig, RedisConnectionConfig};
pub use error::{MarqsError, MarqsResult};
pub use keys::{DefaultKeyProducer, KeyProducer, TenantEnvironment};
pub use message::MessagePayload;
pub use store::{MemoryStore, QueueStore, RedisStore, StoreSnapshot};
pub use strategy::{QueuePriorityStrategy, SimpleWeightedChoiceStrategy};
pub use telemetry::{extract_trace_context, init_telemetry, inject_trace_context};
