// Shard identities and the virtual-to-physical shard map
//
// INVARIANTS:
// 1. A virtual ShardId maps to exactly one physical shard within a map
// 2. Many virtual ShardIds may map to the same physical shard
// 3. Identity, equality and hashing are by value

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};

/// Virtual shard identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    pub const fn new(id: u32) -> Self {
        ShardId(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(id: u32) -> Self {
        ShardId(id)
    }
}

/// Identifier of a physical shard (one database / connection factory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhysicalShardId(pub u32);

impl fmt::Display for PhysicalShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "physical-{}", self.0)
    }
}

/// Maps virtual shards onto physical shards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualShardMap {
    virtual_to_physical: BTreeMap<ShardId, PhysicalShardId>,
}

impl VirtualShardMap {
    /// Builds a map from `(virtual, physical)` pairs.
    ///
    /// Fails if any virtual shard id appears more than once.
    pub fn new<I>(entries: I) -> ShardResult<Self>
    where
        I: IntoIterator<Item = (ShardId, PhysicalShardId)>,
    {
        let mut virtual_to_physical = BTreeMap::new();
        for (shard_id, physical) in entries {
            if let Some(existing) = virtual_to_physical.insert(shard_id, physical) {
                return Err(ShardError::Config(format!(
                    "virtual shard {} is mapped to both {} and {}",
                    shard_id, existing, physical
                )));
            }
        }
        Ok(VirtualShardMap { virtual_to_physical })
    }

    /// One physical shard per virtual shard, sharing the numeric id.
    pub fn identity<I>(shard_ids: I) -> ShardResult<Self>
    where
        I: IntoIterator<Item = ShardId>,
    {
        Self::new(shard_ids.into_iter().map(|id| (id, PhysicalShardId(id.0))))
    }

    pub fn physical_for(&self, shard_id: ShardId) -> Option<PhysicalShardId> {
        self.virtual_to_physical.get(&shard_id).copied()
    }

    /// Virtual shard ids grouped by the physical shard that owns them.
    pub fn shards_by_physical(&self) -> BTreeMap<PhysicalShardId, BTreeSet<ShardId>> {
        let mut grouped: BTreeMap<PhysicalShardId, BTreeSet<ShardId>> = BTreeMap::new();
        for (shard_id, physical) in &self.virtual_to_physical {
            grouped.entry(*physical).or_default().insert(*shard_id);
        }
        grouped
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        self.virtual_to_physical.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.virtual_to_physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_to_physical.is_empty()
    }
}
