//! Contracts with the persistence collaborator.
//!
//! The sharding layer never talks to a database directly. Each physical shard
//! is reached through a [`SessionFactory`] that opens a [`ShardSession`], and
//! each session exposes the local [`ShardTransaction`] the coordinator drives.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ShardResult, TransactionError};
use crate::shard_id::ShardId;

/// Isolation level requested when a shard-local transaction begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

/// Opens sessions against one physical shard.
pub trait SessionFactory: Send + Sync {
    /// Opens a new session serving the given virtual shards.
    fn open_session(&self, shard_ids: &BTreeSet<ShardId>) -> ShardResult<Arc<dyn ShardSession>>;
}

/// An open session on one physical shard.
pub trait ShardSession: Send + Sync {
    /// The session's local transaction. Repeated calls return the same object.
    fn transaction(&self) -> Arc<dyn ShardTransaction>;

    fn close(&self) -> ShardResult<()>;

    /// Lets operation collaborators reach their concrete session type.
    fn as_any(&self) -> &dyn Any;
}

/// Transaction local to one shard session.
///
/// Every failure is reported as a [`TransactionError`], which the sharded
/// transaction coordinator aggregates per phase.
pub trait ShardTransaction: Send + Sync {
    fn begin(&self, isolation: IsolationLevel) -> Result<(), TransactionError>;

    fn commit(&self) -> Result<(), TransactionError>;

    fn rollback(&self) -> Result<(), TransactionError>;

    fn is_active(&self) -> bool;

    fn was_committed(&self) -> bool;

    fn was_rolled_back(&self) -> bool;

    /// Attaches a collaborator command object to this transaction.
    fn enlist(&self, command: &mut dyn Any) -> Result<(), TransactionError>;
}
