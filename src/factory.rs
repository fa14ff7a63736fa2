// Sharded session factory
//
// INVARIANTS:
// 1. Every configured physical shard has exactly one SessionFactory
// 2. The access strategy and its worker pool are shared by all sessions
// 3. Each opened session gets its own Shard handles, one per physical shard

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use log::info;
use shardfan_access::AccessStrategy;
use shardfan_core::{
    PhysicalShardId, SessionFactory, Shard, ShardError, ShardId, ShardResult, ShardingConfig,
    VirtualShardMap,
};
use shardfan_exit::ProjectionRegistry;

use crate::selection::{RoundRobinShardSelection, ShardSelectionStrategy};
use crate::session::ShardedSession;

struct PhysicalShard {
    physical_id: PhysicalShardId,
    shard_ids: BTreeSet<ShardId>,
    factory: Arc<dyn SessionFactory>,
}

pub struct ShardedSessionFactory {
    config: ShardingConfig,
    shard_map: VirtualShardMap,
    physical_shards: Vec<PhysicalShard>,
    access: Arc<AccessStrategy>,
    selection: Arc<dyn ShardSelectionStrategy>,
    projections: ProjectionRegistry,
}

impl ShardedSessionFactory {
    /// Builds a factory from a validated configuration and one session
    /// factory per configured physical shard.
    pub fn new(
        config: ShardingConfig,
        mut factories: HashMap<PhysicalShardId, Arc<dyn SessionFactory>>,
    ) -> ShardResult<Self> {
        config.validate()?;
        let shard_map = config.virtual_shard_map()?;
        if shard_map.is_empty() {
            return Err(ShardError::Config("no shards configured".into()));
        }

        let mut physical_shards = Vec::new();
        for (physical_id, shard_ids) in shard_map.shards_by_physical() {
            let factory = factories.remove(&physical_id).ok_or_else(|| {
                ShardError::Config(format!("no session factory for {}", physical_id))
            })?;
            physical_shards.push(PhysicalShard {
                physical_id,
                shard_ids,
                factory,
            });
        }
        if !factories.is_empty() {
            let mut unknown: Vec<PhysicalShardId> = factories.keys().copied().collect();
            unknown.sort();
            return Err(ShardError::Config(format!(
                "session factories given for unconfigured shards {:?}",
                unknown
            )));
        }

        let access = Arc::new(AccessStrategy::from_config(&config)?);
        let selection = Arc::new(RoundRobinShardSelection::new(shard_map.shard_ids())?);

        info!(
            "[ShardedSessionFactory] {} virtual shards on {} physical shards, {:?} access",
            shard_map.len(),
            physical_shards.len(),
            access.mode()
        );

        Ok(ShardedSessionFactory {
            config,
            shard_map,
            physical_shards,
            access,
            selection,
            projections: ProjectionRegistry::with_defaults(),
        })
    }

    pub fn with_selection_strategy(mut self, selection: Arc<dyn ShardSelectionStrategy>) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_projections(mut self, projections: ProjectionRegistry) -> Self {
        self.projections = projections;
        self
    }

    /// Opens a logical session. No shard session is established until an
    /// operation needs it.
    pub fn open_session(&self) -> ShardResult<ShardedSession> {
        let shards = self
            .physical_shards
            .iter()
            .map(|physical| {
                Shard::new(
                    physical.physical_id,
                    physical.shard_ids.clone(),
                    Arc::clone(&physical.factory),
                )
                .map(Arc::new)
            })
            .collect::<ShardResult<Vec<_>>>()?;

        Ok(ShardedSession::new(
            shards,
            Arc::clone(&self.access),
            Arc::clone(&self.selection),
            self.config.isolation_level,
        ))
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn shard_map(&self) -> &VirtualShardMap {
        &self.shard_map
    }

    pub fn projections(&self) -> &ProjectionRegistry {
        &self.projections
    }

    pub fn access_strategy(&self) -> &AccessStrategy {
        &self.access
    }
}
