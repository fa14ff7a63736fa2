//! Access strategy contracts.

use std::sync::Arc;

use async_trait::async_trait;
use shardfan_core::{AsyncShardOperation, Shard, ShardCommand, ShardOperation, ShardResult};
use shardfan_exit::ExitStrategy;
use tokio_util::sync::CancellationToken;

/// Runs one operation against a set of shards and feeds the exit strategy.
pub trait ShardAccessStrategy: Send + Sync {
    fn apply<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        operation: O,
        exit_strategy: E,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: ShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static;

    /// Runs a command with no result on every shard.
    fn apply_command<C>(&self, shards: &[Arc<Shard>], command: C) -> ShardResult<()>
    where
        C: ShardCommand + 'static;
}

#[async_trait]
pub trait AsyncShardAccessStrategy: Send + Sync {
    /// Async counterpart of [`ShardAccessStrategy::apply`].
    ///
    /// Cancelling `cancel` stops the fan-out and fails the call with
    /// `ShardError::Cancelled`.
    async fn apply_async<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        operation: O,
        exit_strategy: E,
        cancel: &CancellationToken,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: AsyncShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
        E::Output: Send;
}
