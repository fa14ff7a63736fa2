//! Visiting order for sequential access.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shardfan_core::Shard;

/// Chooses the order in which a sequential strategy visits shards.
pub trait ShardOrdering: Send + Sync {
    fn order<'a>(&self, shards: &'a [Arc<Shard>]) -> Vec<&'a Arc<Shard>>;
}

/// Visits shards in the order they were given.
#[derive(Debug, Default, Clone, Copy)]
pub struct IterationOrder;

impl ShardOrdering for IterationOrder {
    fn order<'a>(&self, shards: &'a [Arc<Shard>]) -> Vec<&'a Arc<Shard>> {
        shards.iter().collect()
    }
}

/// Rotates the starting shard on every call to spread load.
#[derive(Debug, Default)]
pub struct RoundRobinOrdering {
    next: AtomicUsize,
}

impl RoundRobinOrdering {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShardOrdering for RoundRobinOrdering {
    fn order<'a>(&self, shards: &'a [Arc<Shard>]) -> Vec<&'a Arc<Shard>> {
        if shards.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % shards.len();
        shards[start..].iter().chain(shards[..start].iter()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::shards;

    fn ids(ordered: Vec<&Arc<Shard>>) -> Vec<u32> {
        ordered.iter().map(|s| s.primary_id().as_u32()).collect()
    }

    #[test]
    fn test_iteration_order_is_identity() {
        let shards = shards(3);
        assert_eq!(ids(IterationOrder.order(&shards)), vec![0, 1, 2]);
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let shards = shards(3);
        let ordering = RoundRobinOrdering::new();
        assert_eq!(ids(ordering.order(&shards)), vec![0, 1, 2]);
        assert_eq!(ids(ordering.order(&shards)), vec![1, 2, 0]);
        assert_eq!(ids(ordering.order(&shards)), vec![2, 0, 1]);
        assert_eq!(ids(ordering.order(&shards)), vec![0, 1, 2]);
        assert!(ordering.order(&[]).is_empty());
    }
}
