//! Choosing the shard a new object is saved to.

use std::sync::atomic::{AtomicUsize, Ordering};

use shardfan_core::{Entity, ShardError, ShardId, ShardResult};

pub trait ShardSelectionStrategy: Send + Sync {
    fn select_shard_for_new_object(&self, entity: &Entity) -> ShardResult<ShardId>;
}

/// Cycles through the configured virtual shards.
#[derive(Debug)]
pub struct RoundRobinShardSelection {
    shard_ids: Vec<ShardId>,
    next: AtomicUsize,
}

impl RoundRobinShardSelection {
    pub fn new(shard_ids: impl IntoIterator<Item = ShardId>) -> ShardResult<Self> {
        let shard_ids: Vec<ShardId> = shard_ids.into_iter().collect();
        if shard_ids.is_empty() {
            return Err(ShardError::Config(
                "round-robin selection needs at least one shard".into(),
            ));
        }
        Ok(RoundRobinShardSelection {
            shard_ids,
            next: AtomicUsize::new(0),
        })
    }
}

impl ShardSelectionStrategy for RoundRobinShardSelection {
    fn select_shard_for_new_object(&self, _entity: &Entity) -> ShardResult<ShardId> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.shard_ids.len();
        Ok(self.shard_ids[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_through_shards() {
        let selection = RoundRobinShardSelection::new([ShardId(4), ShardId(7)]).unwrap();
        let entity = Entity::new("Order");
        let picks: Vec<u32> = (0..5)
            .map(|_| selection.select_shard_for_new_object(&entity).unwrap().as_u32())
            .collect();
        assert_eq!(picks, vec![4, 7, 4, 7, 4]);
        assert!(RoundRobinShardSelection::new(Vec::new()).is_err());
    }
}
