//! Queue selection across a very large population of child queues.
//!
//! The parent ZSET orders child queues by their oldest pending message, so a
//! small window at the head is enough to see the queues most at risk of
//! starvation. The default strategy takes that window, drops queues with no
//! concurrency headroom, and picks one at random weighted by headroom and
//! age. Selection is intentionally randomized between child queues; FIFO
//! only holds within a single (queue, concurrency key) shard.

use rand::Rng;
use uuid::Uuid;

use crate::store::QueueCapacities;

/// Index window into a parent ZSET plus a correlation token.
#[derive(Debug, Clone)]
pub struct CandidateSelection {
    /// Inclusive `(start, stop)` index range, ascending score order.
    pub range: (usize, usize),
    /// Opaque token tying this window to the subsequent choice.
    pub selection_id: String,
}

/// One child queue inside a candidate window.
#[derive(Debug, Clone)]
pub struct QueueCandidate {
    /// Fully resolved child queue key.
    pub queue: String,
    /// Age of the queue's oldest pending message.
    pub age_ms: i64,
    pub capacities: QueueCapacities,
}

/// Picks which child queue a dequeue should try next.
///
/// The broker holds independent instances for the shared-parent and
/// env-parent paths; implementations may keep small advisory state but must
/// tolerate losing it.
pub trait QueuePriorityStrategy: Send + Sync {
    /// Which slice of the parent to consider.
    fn next_candidate_selection(&self, parent_queue: &str) -> CandidateSelection;

    /// Pick one queue out of the window, or `None` when every candidate is
    /// saturated — the caller must then abort the dequeue.
    fn choose_queue(
        &self,
        candidates: &[QueueCandidate],
        parent_queue: &str,
        selection_id: &str,
    ) -> Option<String>;
}

/// Weighted random choice over the oldest-K window.
///
/// Weight is `available * (1 + age_ms / age_normalizer_ms)`: headroom
/// dominates, but a queue that has waited `age_normalizer_ms` doubles its
/// odds, so old queues cannot be starved by busy ones indefinitely.
#[derive(Debug, Clone)]
pub struct SimpleWeightedChoiceStrategy {
    pub queue_selection_count: usize,
    pub age_normalizer_ms: f64,
}

impl Default for SimpleWeightedChoiceStrategy {
    fn default() -> Self {
        Self {
            queue_selection_count: 12,
            age_normalizer_ms: 30_000.0,
        }
    }
}

impl SimpleWeightedChoiceStrategy {
    pub fn new(queue_selection_count: usize) -> Self {
        Self {
            queue_selection_count,
            ..Self::default()
        }
    }

    fn weight(&self, candidate: &QueueCandidate) -> f64 {
        let available = candidate.capacities.available() as f64;
        let age = candidate.age_ms.max(0) as f64;
        available * (1.0 + age / self.age_normalizer_ms)
    }
}

impl QueuePriorityStrategy for SimpleWeightedChoiceStrategy {
    fn next_candidate_selection(&self, _parent_queue: &str) -> CandidateSelection {
        CandidateSelection {
            range: (0, self.queue_selection_count.saturating_sub(1)),
            selection_id: Uuid::new_v4().to_string(),
        }
    }

    fn choose_queue(
        &self,
        candidates: &[QueueCandidate],
        _parent_queue: &str,
        _selection_id: &str,
    ) -> Option<String> {
        let mut weighted: Vec<(&QueueCandidate, f64)> = candidates
            .iter()
            .filter(|c| c.capacities.available() > 0)
            .map(|c| (c, self.weight(c)))
            .collect();

        if weighted.is_empty() {
            return None;
        }

        // Key order makes equal-weight outcomes reproducible for a given
        // random draw.
        weighted.sort_by(|a, b| a.0.queue.cmp(&b.0.queue));

        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        let mut point = rand::thread_rng().gen_range(0.0..total);
        for (candidate, weight) in &weighted {
            if point < *weight {
                return Some(candidate.queue.clone());
            }
            point -= weight;
        }

        // Floating point underflow on the last subtraction.
        weighted.last().map(|(c, _)| c.queue.clone())
    }
}
