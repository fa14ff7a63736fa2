// Sequential access strategy
//
// INVARIANTS:
// 1. Shards are visited one at a time, in the order chosen by the ShardOrdering
// 2. A halt from the exit strategy stops the walk before the next shard
// 3. All work runs on the calling thread (or the caller's await chain)

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error};
use shardfan_core::{
    AsyncShardOperation, Shard, ShardCommand, ShardError, ShardOperation, ShardResult,
};
use shardfan_exit::ExitStrategy;
use tokio_util::sync::CancellationToken;

use crate::access::{AsyncShardAccessStrategy, ShardAccessStrategy};
use crate::command::{CommandOperation, DiscardExitStrategy};
use crate::ordering::{IterationOrder, ShardOrdering};

pub struct SequentialShardAccessStrategy {
    ordering: Box<dyn ShardOrdering>,
}

impl Default for SequentialShardAccessStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl SequentialShardAccessStrategy {
    /// Visits shards in the order given.
    pub fn new() -> Self {
        Self::with_ordering(IterationOrder)
    }

    pub fn with_ordering(ordering: impl ShardOrdering + 'static) -> Self {
        SequentialShardAccessStrategy {
            ordering: Box::new(ordering),
        }
    }
}

fn shard_failure(operation: &str, shard: &Shard, err: ShardError) -> ShardError {
    error!(
        "[SequentialAccess] `{}` failed on shard {}: {}",
        operation,
        shard.primary_id(),
        err
    );
    ShardError::aggregate(operation, shard.primary_id(), err)
}

impl ShardAccessStrategy for SequentialShardAccessStrategy {
    fn apply<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        mut operation: O,
        exit_strategy: E,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: ShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
    {
        let name = operation.operation_name().to_string();

        for shard in self.ordering.order(shards) {
            let outcome = operation.prepare(shard).and_then(|work| work());
            match outcome {
                Ok(Some(result)) => {
                    if exit_strategy.add_result(result, shard) {
                        debug!(
                            "[SequentialAccess] `{}` satisfied at shard {}",
                            name,
                            shard.primary_id()
                        );
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => return Err(shard_failure(&name, shard, err)),
            }
        }

        exit_strategy.compile_results()
    }

    fn apply_command<C>(&self, shards: &[Arc<Shard>], command: C) -> ShardResult<()>
    where
        C: ShardCommand + 'static,
    {
        self.apply(shards, CommandOperation::new(command), DiscardExitStrategy)
    }
}

#[async_trait]
impl AsyncShardAccessStrategy for SequentialShardAccessStrategy {
    async fn apply_async<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        mut operation: O,
        exit_strategy: E,
        cancel: &CancellationToken,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: AsyncShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
        E::Output: Send,
    {
        let name = operation.operation_name().to_string();

        for shard in self.ordering.order(shards) {
            if cancel.is_cancelled() {
                return Err(ShardError::Cancelled { operation: name });
            }

            let work = operation
                .prepare(shard)
                .map_err(|err| shard_failure(&name, shard, err))?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ShardError::Cancelled { operation: name });
                }
                outcome = work => outcome,
            };

            match outcome {
                Ok(Some(result)) => {
                    if exit_strategy.add_result(result, shard) {
                        debug!(
                            "[SequentialAccess] `{}` satisfied at shard {}",
                            name,
                            shard.primary_id()
                        );
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => return Err(shard_failure(&name, shard, err)),
            }
        }

        exit_strategy.compile_results()
    }
}
