//! Atomic Lua programs.
//!
//! Each constant is one server-side script and one unit of atomicity; the
//! [`Scripts`] holder wraps them in [`redis::Script`] so they run as EVALSHA
//! with automatic EVAL fallback. Every script that mutates a child queue
//! ends by re-reading the child's minimum and upserting (or removing) the
//! child in both parents — skipping that rebalance is how the parent index
//! silently rots.

/// Write the body, insert into the child queue, rebalance parents.
///
/// KEYS: child queue, shared parent, env parent, message body.
/// ARGV: parent member (the child key), message id, serialized body, score.
pub(crate) const ENQUEUE: &str = r#"
local childQueue = KEYS[1]
local sharedParent = KEYS[2]
local envParent = KEYS[3]
local messageKey = KEYS[4]

local queueName = ARGV[1]
local messageId = ARGV[2]
local messageData = ARGV[3]
local messageScore = tonumber(ARGV[4])

local function rebalance(parentQueue)
    local earliest = redis.call('ZRANGE', childQueue, 0, 0, 'WITHSCORES')
    if #earliest == 0 then
        redis.call('ZREM', parentQueue, queueName)
    else
        redis.call('ZADD', parentQueue, earliest[2], queueName)
    end
end

redis.call('SET', messageKey, messageData)
redis.call('ZADD', childQueue, messageScore, messageId)
rebalance(sharedParent)
rebalance(envParent)
"#;

/// Claim the oldest due message when every ceiling has headroom.
///
/// KEYS: child queue, shared parent, env parent, visibility ZSET,
/// queue/env/org limit keys, queue/env/org current sets.
/// ARGV: parent member, visibility timeout ms, now ms, three default limits.
/// Returns nil, or `{messageId, score}` with the score as a bulk string.
pub(crate) const DEQUEUE: &str = r#"
local childQueue = KEYS[1]
local sharedParent = KEYS[2]
local envParent = KEYS[3]
local visibilityQueue = KEYS[4]
local queueConcurrencyLimitKey = KEYS[5]
local envConcurrencyLimitKey = KEYS[6]
local orgConcurrencyLimitKey = KEYS[7]
local queueCurrentConcurrencyKey = KEYS[8]
local envCurrentConcurrencyKey = KEYS[9]
local orgCurrentConcurrencyKey = KEYS[10]

local queueName = ARGV[1]
local visibilityTimeout = tonumber(ARGV[2])
local currentTime = tonumber(ARGV[3])
local defaultQueueLimit = tonumber(ARGV[4])
local defaultEnvLimit = tonumber(ARGV[5])
local defaultOrgLimit = tonumber(ARGV[6])

local orgCurrent = redis.call('SCARD', orgCurrentConcurrencyKey)
local orgLimit = tonumber(redis.call('GET', orgConcurrencyLimitKey)) or defaultOrgLimit
if orgCurrent >= orgLimit then
    return nil
end

local envCurrent = redis.call('SCARD', envCurrentConcurrencyKey)
local envLimit = tonumber(redis.call('GET', envConcurrencyLimitKey)) or defaultEnvLimit
if envCurrent >= envLimit then
    return nil
end

local queueCurrent = redis.call('SCARD', queueCurrentConcurrencyKey)
local queueLimit = tonumber(redis.call('GET', queueConcurrencyLimitKey)) or defaultQueueLimit
if queueCurrent >= queueLimit then
    return nil
end

local messages = redis.call('ZRANGEBYSCORE', childQueue, '-inf', currentTime, 'WITHSCORES', 'LIMIT', 0, 1)
if #messages == 0 then
    return nil
end

local messageId = messages[1]
local messageScore = messages[2]

redis.call('ZREM', childQueue, messageId)
redis.call('ZADD', visibilityQueue, currentTime + visibilityTimeout, messageId)
redis.call('SADD', queueCurrentConcurrencyKey, messageId)
redis.call('SADD', envCurrentConcurrencyKey, messageId)
redis.call('SADD', orgCurrentConcurrencyKey, messageId)

local function rebalance(parentQueue)
    local earliest = redis.call('ZRANGE', childQueue, 0, 0, 'WITHSCORES')
    if #earliest == 0 then
        redis.call('ZREM', parentQueue, queueName)
    else
        redis.call('ZADD', parentQueue, earliest[2], queueName)
    end
end

rebalance(sharedParent)
rebalance(envParent)

return {messageId, messageScore}
"#;

/// Destroy a message: body, lease, and all three concurrency markers.
/// Idempotent over keys that are already gone.
///
/// KEYS: message body, visibility ZSET, queue/env/org current sets.
/// ARGV: message id.
pub(crate) const ACK: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
"#;

/// Return an in-flight message to its queue at a caller-chosen score.
///
/// KEYS: child queue, shared parent, env parent, visibility ZSET,
/// queue/env/org current sets.
/// ARGV: parent member, message id, new score.
/// Returns 1 when requeued, 0 when the id was not leased (lost race).
pub(crate) const NACK: &str = r#"
local childQueue = KEYS[1]
local sharedParent = KEYS[2]
local envParent = KEYS[3]
local visibilityQueue = KEYS[4]
local queueCurrentConcurrencyKey = KEYS[5]
local envCurrentConcurrencyKey = KEYS[6]
local orgCurrentConcurrencyKey = KEYS[7]

local queueName = ARGV[1]
local messageId = ARGV[2]
local messageScore = tonumber(ARGV[3])

if redis.call('ZSCORE', visibilityQueue, messageId) == false then
    return 0
end

redis.call('ZREM', visibilityQueue, messageId)
redis.call('SREM', queueCurrentConcurrencyKey, messageId)
redis.call('SREM', envCurrentConcurrencyKey, messageId)
redis.call('SREM', orgCurrentConcurrencyKey, messageId)
redis.call('ZADD', childQueue, messageScore, messageId)

local function rebalance(parentQueue)
    local earliest = redis.call('ZRANGE', childQueue, 0, 0, 'WITHSCORES')
    if #earliest == 0 then
        redis.call('ZREM', parentQueue, queueName)
    else
        redis.call('ZADD', parentQueue, earliest[2], queueName)
    end
end

rebalance(sharedParent)
rebalance(envParent)

return 1
"#;

/// Extend an in-flight lease, clamped to the caller's deadline.
///
/// KEYS: visibility ZSET. ARGV: message id, extension ms, max deadline ms.
pub(crate) const HEARTBEAT: &str = r#"
local visibilityQueue = KEYS[1]
local messageId = ARGV[1]
local extension = tonumber(ARGV[2])
local maxDeadline = tonumber(ARGV[3])

local currentDeadline = tonumber(redis.call('ZSCORE', visibilityQueue, messageId))
if currentDeadline == nil then
    return 0
end

local newDeadline = math.min(currentDeadline + extension, maxDeadline)
redis.call('ZADD', visibilityQueue, newDeadline, messageId)
return 1
"#;

/// Read the six (current, limit) numbers for one child queue.
///
/// KEYS: queue/env/org current sets, queue/env/org limit keys.
/// ARGV: three default limits.
pub(crate) const COMPUTE_CAPACITIES: &str = r#"
local queueCurrent = redis.call('SCARD', KEYS[1])
local envCurrent = redis.call('SCARD', KEYS[2])
local orgCurrent = redis.call('SCARD', KEYS[3])
local queueLimit = tonumber(redis.call('GET', KEYS[4])) or tonumber(ARGV[1])
local envLimit = tonumber(redis.call('GET', KEYS[5])) or tonumber(ARGV[2])
local orgLimit = tonumber(redis.call('GET', KEYS[6])) or tonumber(ARGV[3])

return {queueCurrent, queueLimit, envCurrent, envLimit, orgCurrent, orgLimit}
"#;

/// Set the env and org ceilings together.
///
/// KEYS: env limit key, org limit key. ARGV: env value, org value.
pub(crate) const UPDATE_GLOBAL_LIMITS: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
"#;

/// Loaded script handles, created once per store.
pub(crate) struct Scripts {
    pub enqueue: redis::Script,
    pub dequeue: redis::Script,
    pub ack: redis::Script,
    pub nack: redis::Script,
    pub heartbeat: redis::Script,
    pub compute_capacities: redis::Script,
    pub update_global_limits: redis::Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: redis::Script::new(ENQUEUE),
            dequeue: redis::Script::new(DEQUEUE),
            ack: redis::Script::new(ACK),
            nack: redis::Script::new(NACK),
            heartbeat: redis::Script::new(HEARTBEAT),
            compute_capacities: redis::Script::new(COMPUTE_CAPACITIES),
            update_global_limits: redis::Script::new(UPDATE_GLOBAL_LIMITS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every mutation of a child queue must refresh both parent indexes.
    #[test]
    fn child_mutating_scripts_rebalance_both_parents() {
        for source in [ENQUEUE, DEQUEUE, NACK] {
            assert!(source.contains("rebalance(sharedParent)"));
            assert!(source.contains("rebalance(envParent)"));
        }
    }

    #[test]
    fn ceilings_are_checked_outermost_first() {
        let org = DEQUEUE.find("orgCurrent >= orgLimit").unwrap();
        let env = DEQUEUE.find("envCurrent >= envLimit").unwrap();
        let queue = DEQUEUE.find("queueCurrent >= queueLimit").unwrap();
        assert!(org < env && env < queue);
    }

    #[test]
    fn nack_guards_on_visibility_membership() {
        assert!(NACK.contains("ZSCORE"));
        assert!(NACK.trim_start().starts_with("local childQueue"));
    }

    #[test]
    fn script_handles_are_distinct() {
        let scripts = Scripts::new();
        let hashes = [
            scripts.enqueue.get_hash(),
            scripts.dequeue.get_hash(),
            scripts.ack.get_hash(),
            scripts.nack.get_hash(),
            scripts.heartbeat.get_hash(),
            scripts.compute_capacities.get_hash(),
            scripts.update_global_limits.get_hash(),
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in hashes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
