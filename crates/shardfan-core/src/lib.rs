//! shardfan-core: shared primitives of the shardfan sharding layer.
//!
//! Shard identities, the lazily established per-shard session holder, the
//! contracts with the persistence collaborator, the value model shard results
//! are expressed in, configuration and the error taxonomy.

pub mod config;
pub mod error;
pub mod operation;
pub mod session;
pub mod shard;
pub mod shard_id;
pub mod value;

pub use config::{AccessMode, PhysicalShardConfig, ShardingConfig, DEFAULT_PARALLEL_TIMEOUT};
pub use error::{ShardError, ShardResult, TransactionError, TransactionPhase};
pub use operation::{
    async_operation_fn, command_fn, operation_fn, AsyncShardOperation, PreparedAsyncWork,
    PreparedCommand, PreparedWork, ShardCommand, ShardOperation,
};
pub use session::{IsolationLevel, SessionFactory, ShardSession, ShardTransaction};
pub use shard::{OnEstablish, Shard};
pub use shard_id::{PhysicalShardId, ShardId, VirtualShardMap};
pub use value::{Entity, Value};
