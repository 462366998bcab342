//! Key production for every structure the broker stores.
//!
//! All state lives in a single logical Redis keyspace under a fixed prefix.
//! The [`KeyProducer`] trait turns logical identifiers (environment,
//! organization, queue name, optional concurrency key, message id) into the
//! concrete keys used by the atomic scripts. The child queue key embeds the
//! organization and environment so that every sibling key (concurrency sets,
//! limit keys, the env-scoped parent) can be reconstructed from the child key
//! alone via the `*_from_queue` family — the parent "queue of queues" stores
//! child keys as members and the dequeue path starts from nothing else.

/// Default prefix applied to every key.
pub const KEY_PREFIX: &str = "marqs:";

/// Maximum length of a sanitized name segment.
const MAX_NAME_LEN: usize = 128;

/// Tenant identity as resolved by the surrounding system.
///
/// Authentication and tenant resolution are external concerns; the broker
/// only needs the environment id, the owning organization id, and the
/// tenant-configured concurrency ceilings pushed down by
/// [`update_env_concurrency_limits`](crate::Marqs::update_env_concurrency_limits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantEnvironment {
    pub id: String,
    pub organization_id: String,
    pub env_concurrency_limit: u64,
    pub org_concurrency_limit: u64,
}

/// Strip everything but alphanumerics, underscore, hyphen and slash, then
/// truncate to 128 characters. Applied to queue names, concurrency keys and
/// tenant ids before they are embedded in keys.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/'))
        .take(MAX_NAME_LEN)
        .collect()
}

/// Pluggable key scheme.
///
/// The default implementation is [`DefaultKeyProducer`]; tests or migrations
/// may swap in another scheme as long as the `*_from_queue` reconstruction
/// contract holds.
pub trait KeyProducer: Send + Sync {
    /// Child queue ZSET: members are message ids scored by enqueue time.
    fn queue_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String;

    /// Env-scoped parent ZSET: members are child queue keys.
    fn env_shared_queue_key(&self, env: &TenantEnvironment) -> String;

    /// Global parent ZSET shared by all environments.
    fn shared_queue_key(&self) -> String;

    /// Message body string key.
    fn message_key(&self, message_id: &str) -> String;

    /// Visibility-timeout ZSET: members are in-flight message ids scored by
    /// their lease deadline.
    fn visibility_queue_key(&self) -> String;

    /// Queue concurrency ceiling. Never includes the concurrency-key
    /// suffix: concurrency-keyed subqueues share their queue's cap.
    fn concurrency_limit_key(&self, env: &TenantEnvironment, queue: &str) -> String;

    /// Set of in-flight message ids for one (queue, concurrency key) shard.
    fn current_concurrency_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String;

    fn env_concurrency_limit_key(&self, env: &TenantEnvironment) -> String;
    fn env_current_concurrency_key(&self, env: &TenantEnvironment) -> String;
    fn org_concurrency_limit_key(&self, env: &TenantEnvironment) -> String;
    fn org_current_concurrency_key(&self, env: &TenantEnvironment) -> String;

    // Reconstruction from a child queue key. The dequeue path selects a
    // child key out of a parent ZSET and derives everything else from it.

    fn env_shared_queue_key_from_queue(&self, queue_key: &str) -> String;
    fn concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
    fn env_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn env_current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
    fn org_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String;
    fn org_current_concurrency_key_from_queue(&self, queue_key: &str) -> String;
}

/// Key scheme used in production.
///
/// Shapes (all under the configured prefix):
///
/// ```text
/// queue:{org}:{env}:{name}[:ck:{ck}]   child queue ZSET
/// env:{env}:sharedQueue                env parent ZSET
/// sharedQueue                          global parent ZSET
/// message:{messageId}                  message body
/// msgVisibilityTimeout                 visibility ZSET
/// cl:{env}:{name}                      queue concurrency limit
/// cc:{env}:{name}[:ck:{ck}]            queue concurrency current
/// el:{env}  / ecc:{env}                env limit / current
/// ol:{org}  / occ:{org}                org limit / current
/// ```
#[derive(Debug, Clone)]
pub struct DefaultKeyProducer {
    prefix: String,
}

impl Default for DefaultKeyProducer {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

/// The pieces of a child queue key, recovered by parsing.
#[derive(Debug, PartialEq, Eq)]
struct ParsedQueueKey {
    org: String,
    env: String,
    name: String,
    concurrency_key: Option<String>,
}

impl DefaultKeyProducer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn ck_suffix(concurrency_key: Option<&str>) -> String {
        match concurrency_key {
            Some(ck) => format!(":ck:{}", sanitize_name(ck)),
            None => String::new(),
        }
    }

    /// Parse `{prefix}queue:{org}:{env}:{name}[:ck:{ck}]`. Sanitizing keeps
    /// `:` out of every segment except the literal separators, so splitting
    /// on `:` is unambiguous (`/` is allowed inside names and is harmless).
    fn parse(&self, queue_key: &str) -> ParsedQueueKey {
        let rest = queue_key.strip_prefix(&self.prefix).unwrap_or(queue_key);
        let rest = rest.strip_prefix("queue:").unwrap_or(rest);

        let (base, concurrency_key) = match rest.split_once(":ck:") {
            Some((base, ck)) => (base, Some(ck.to_string())),
            None => (rest, None),
        };

        let mut parts = base.splitn(3, ':');
        let org = parts.next().unwrap_or_default().to_string();
        let env = parts.next().unwrap_or_default().to_string();
        let name = parts.next().unwrap_or_default().to_string();

        ParsedQueueKey {
            org,
            env,
            name,
            concurrency_key,
        }
    }
}

impl KeyProducer for DefaultKeyProducer {
    fn queue_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        format!(
            "{}queue:{}:{}:{}{}",
            self.prefix,
            sanitize_name(&env.organization_id),
            sanitize_name(&env.id),
            sanitize_name(queue),
            Self::ck_suffix(concurrency_key),
        )
    }

    fn env_shared_queue_key(&self, env: &TenantEnvironment) -> String {
        format!("{}env:{}:sharedQueue", self.prefix, sanitize_name(&env.id))
    }

    fn shared_queue_key(&self) -> String {
        format!("{}sharedQueue", self.prefix)
    }

    fn message_key(&self, message_id: &str) -> String {
        format!("{}message:{}", self.prefix, message_id)
    }

    fn visibility_queue_key(&self) -> String {
        format!("{}msgVisibilityTimeout", self.prefix)
    }

    fn concurrency_limit_key(&self, env: &TenantEnvironment, queue: &str) -> String {
        format!(
            "{}cl:{}:{}",
            self.prefix,
            sanitize_name(&env.id),
            sanitize_name(queue)
        )
    }

    fn current_concurrency_key(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> String {
        format!(
            "{}cc:{}:{}{}",
            self.prefix,
            sanitize_name(&env.id),
            sanitize_name(queue),
            Self::ck_suffix(concurrency_key),
        )
    }

    fn env_concurrency_limit_key(&self, env: &TenantEnvironment) -> String {
        format!("{}el:{}", self.prefix, sanitize_name(&env.id))
    }

    fn env_current_concurrency_key(&self, env: &TenantEnvironment) -> String {
        format!("{}ecc:{}", self.prefix, sanitize_name(&env.id))
    }

    fn org_concurrency_limit_key(&self, env: &TenantEnvironment) -> String {
        format!(
            "{}ol:{}",
            self.prefix,
            sanitize_name(&env.organization_id)
        )
    }

    fn org_current_concurrency_key(&self, env: &TenantEnvironment) -> String {
        format!(
            "{}occ:{}",
            self.prefix,
            sanitize_name(&env.organization_id)
        )
    }

    fn env_shared_queue_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        format!("{}env:{}:sharedQueue", self.prefix, parsed.env)
    }

    fn concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        // Limit key is derived from the child key with any :ck: suffix
        // stripped, so concurrency-keyed subqueues share one cap.
        let parsed = self.parse(queue_key);
        format!("{}cl:{}:{}", self.prefix, parsed.env, parsed.name)
    }

    fn current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        let ck = match &parsed.concurrency_key {
            Some(ck) => format!(":ck:{ck}"),
            None => String::new(),
        };
        format!("{}cc:{}:{}{}", self.prefix, parsed.env, parsed.name, ck)
    }

    fn env_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        format!("{}el:{}", self.prefix, parsed.env)
    }

    fn env_current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        format!("{}ecc:{}", self.prefix, parsed.env)
    }

    fn org_concurrency_limit_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        format!("{}ol:{}", self.prefix, parsed.org)
    }

    fn org_current_concurrency_key_from_queue(&self, queue_key: &str) -> String {
        let parsed = self.parse(queue_key);
        format!("{}occ:{}", self.prefix, parsed.org)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> TenantEnvironment {
        TenantEnvironment {
            id: "env_123".to_string(),
            organization_id: "org_456".to_string(),
            env_concurrency_limit: 100,
            org_concurrency_limit: 300,
        }
    }

    #[test]
    fn queue_key_embeds_org_and_env() {
        let keys = DefaultKeyProducer::default();
        let env = test_env();

        assert_eq!(
            keys.queue_key(&env, "emails", None),
            "marqs:queue:org_456:env_123:emails"
        );
        assert_eq!(
            keys.queue_key(&env, "emails", Some("user-1")),
            "marqs:queue:org_456:env_123:emails:ck:user-1"
        );
    }

    #[test]
    fn limit_key_ignores_concurrency_key() {
        let keys = DefaultKeyProducer::default();
        let env = test_env();

        let plain = keys.queue_key(&env, "emails", None);
        let sharded = keys.queue_key(&env, "emails", Some("user-1"));

        // Subqueues share the parent queue's cap but track their own
        // in-flight sets.
        assert_eq!(
            keys.concurrency_limit_key_from_queue(&plain),
            keys.concurrency_limit_key_from_queue(&sharded)
        );
        assert_ne!(
            keys.current_concurrency_key_from_queue(&plain),
            keys.current_concurrency_key_from_queue(&sharded)
        );
    }

    #[test]
    fn from_queue_reconstruction_matches_direct_construction() {
        let keys = DefaultKeyProducer::default();
        let env = test_env();
        let queue_key = keys.queue_key(&env, "tasks/high", Some("shard-9"));

        assert_eq!(
            keys.env_shared_queue_key_from_queue(&queue_key),
            keys.env_shared_queue_key(&env)
        );
        assert_eq!(
            keys.concurrency_limit_key_from_queue(&queue_key),
            keys.concurrency_limit_key(&env, "tasks/high")
        );
        assert_eq!(
            keys.current_concurrency_key_from_queue(&queue_key),
            keys.current_concurrency_key(&env, "tasks/high", Some("shard-9"))
        );
        assert_eq!(
            keys.env_concurrency_limit_key_from_queue(&queue_key),
            keys.env_concurrency_limit_key(&env)
        );
        assert_eq!(
            keys.env_current_concurrency_key_from_queue(&queue_key),
            keys.env_current_concurrency_key(&env)
        );
        assert_eq!(
            keys.org_concurrency_limit_key_from_queue(&queue_key),
            keys.org_concurrency_limit_key(&env)
        );
        assert_eq!(
            keys.org_current_concurrency_key_from_queue(&queue_key),
            keys.org_current_concurrency_key(&env)
        );
    }

    #[test]
    fn sanitize_strips_separators_and_truncates() {
        assert_eq!(sanitize_name("a:b c!d"), "abcd");
        assert_eq!(sanitize_name("tasks/high_prio-v2"), "tasks/high_prio-v2");

        let long = "x".repeat(200);
        assert_eq!(sanitize_name(&long).len(), 128);
    }

    #[test]
    fn custom_prefix_is_honored() {
        let keys = DefaultKeyProducer::new("test:");
        assert_eq!(keys.shared_queue_key(), "test:sharedQueue");
        assert_eq!(keys.visibility_queue_key(), "test:msgVisibilityTimeout");
        assert_eq!(keys.message_key("m1"), "test:message:m1");
    }
}
