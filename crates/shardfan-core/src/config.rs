// Sharding configuration
//
// INVARIANTS:
// 1. The parallel timeout and the worker pool size are never zero
// 2. Every physical shard owns at least one virtual shard
// 3. No virtual shard is mapped to two physical shards

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};
use crate::session::IsolationLevel;
use crate::shard_id::{PhysicalShardId, ShardId, VirtualShardMap};

/// Wall-clock bound for one parallel fan-out.
pub const DEFAULT_PARALLEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment prefix for configuration overrides (`SHARDFAN_PARALLEL_TIMEOUT_MS`, ...).
pub const ENV_PREFIX: &str = "SHARDFAN";

/// How shards are visited for a logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Sequential,
    Parallel,
}

/// One physical shard and the virtual shards it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalShardConfig {
    pub physical_id: u32,
    pub virtual_shards: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Access strategy used by sharded sessions
    pub access_strategy: AccessMode,

    /// Deadline for a whole parallel fan-out, in milliseconds
    pub parallel_timeout_ms: u64,

    /// Worker threads in the parallel access pool
    pub worker_threads: usize,

    /// Isolation level for shard-local transactions
    pub isolation_level: IsolationLevel,

    /// Rotate the sequential visiting order between calls
    pub load_balance: bool,

    /// Physical shard layout
    pub shards: Vec<PhysicalShardConfig>,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ShardingConfig {
    fn default() -> Self {
        ShardingConfig {
            access_strategy: AccessMode::default(),
            parallel_timeout_ms: DEFAULT_PARALLEL_TIMEOUT.as_millis() as u64,
            worker_threads: default_worker_threads(),
            isolation_level: IsolationLevel::default(),
            load_balance: false,
            shards: Vec::new(),
        }
    }
}

impl ShardingConfig {
    /// Loads configuration from an optional file, then applies `SHARDFAN_*`
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> ShardResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("[ShardingConfig] Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let config: ShardingConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> ShardResult<Self> {
        let config: ShardingConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> ShardResult<Self> {
        let config: ShardingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Adds a physical shard hosting the given virtual shards.
    pub fn with_physical_shard(mut self, physical_id: u32, virtual_shards: &[u32]) -> Self {
        self.shards.push(PhysicalShardConfig {
            physical_id,
            virtual_shards: virtual_shards.to_vec(),
        });
        self
    }

    pub fn parallel_timeout(&self) -> Duration {
        Duration::from_millis(self.parallel_timeout_ms)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.parallel_timeout_ms == 0 {
            return Err(ShardError::Config("parallel_timeout_ms must be positive".into()));
        }
        if self.worker_threads == 0 {
            return Err(ShardError::Config("worker_threads must be positive".into()));
        }

        let mut physical_ids = BTreeSet::new();
        for shard in &self.shards {
            if !physical_ids.insert(shard.physical_id) {
                return Err(ShardError::Config(format!(
                    "physical shard {} is configured twice",
                    shard.physical_id
                )));
            }
            if shard.virtual_shards.is_empty() {
                return Err(ShardError::Config(format!(
                    "physical shard {} hosts no virtual shards",
                    shard.physical_id
                )));
            }
        }

        self.virtual_shard_map().map(|_| ())
    }

    pub fn virtual_shard_map(&self) -> ShardResult<VirtualShardMap> {
        VirtualShardMap::new(self.shards.iter().flat_map(|shard| {
            shard
                .virtual_shards
                .iter()
                .map(move |id| (ShardId(*id), PhysicalShardId(shard.physical_id)))
        }))
    }
}
