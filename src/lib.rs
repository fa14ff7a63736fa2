//! shardfan: a transparent sharding layer.
//!
//! A [`ShardedSessionFactory`] is built from a [`ShardingConfig`] and one
//! [`SessionFactory`] per physical shard. Each [`ShardedSession`] it opens
//! fans logical reads and writes out to the shards through the configured
//! access strategy, merges the per-shard results through an exit strategy and
//! coordinates one [`ShardedTransaction`] over every shard.

pub mod factory;
pub mod selection;
pub mod session;

pub use factory::ShardedSessionFactory;
pub use selection::{RoundRobinShardSelection, ShardSelectionStrategy};
pub use session::ShardedSession;

pub use shardfan_access as access;
pub use shardfan_exit as exit;
pub use shardfan_txn as txn;

pub use shardfan_core::{
    async_operation_fn, command_fn, operation_fn, AccessMode, AsyncShardOperation, Entity,
    IsolationLevel, PreparedAsyncWork, PreparedCommand, PreparedWork, ShardCommand,
    ShardOperation, PhysicalShardId, SessionFactory, Shard, ShardError, ShardId,
    ShardResult, ShardSession, ShardTransaction, ShardingConfig, TransactionError, Value,
};
pub use shardfan_exit::{Aggregation, ExitOperation, OrderBy, Projection, ProjectionRegistry};
pub use shardfan_txn::{ShardedTransaction, TransactionState, TransactionSynchronization};
