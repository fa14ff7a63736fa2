//! Access strategy selected from configuration.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use shardfan_core::{
    AccessMode, AsyncShardOperation, Shard, ShardCommand, ShardOperation, ShardResult,
    ShardingConfig,
};
use shardfan_exit::ExitStrategy;
use tokio_util::sync::CancellationToken;

use crate::access::{AsyncShardAccessStrategy, ShardAccessStrategy};
use crate::ordering::RoundRobinOrdering;
use crate::parallel::ParallelShardAccessStrategy;
use crate::sequential::SequentialShardAccessStrategy;

pub enum AccessStrategy {
    Sequential(SequentialShardAccessStrategy),
    Parallel(ParallelShardAccessStrategy),
}

impl AccessStrategy {
    pub fn from_config(config: &ShardingConfig) -> ShardResult<Self> {
        let strategy = match config.access_strategy {
            AccessMode::Sequential if config.load_balance => AccessStrategy::Sequential(
                SequentialShardAccessStrategy::with_ordering(RoundRobinOrdering::new()),
            ),
            AccessMode::Sequential => {
                AccessStrategy::Sequential(SequentialShardAccessStrategy::new())
            }
            AccessMode::Parallel => AccessStrategy::Parallel(ParallelShardAccessStrategy::new(
                config.worker_threads,
                config.parallel_timeout(),
            )?),
        };
        info!("[AccessStrategy] Using {:?} access", config.access_strategy);
        Ok(strategy)
    }

    pub fn mode(&self) -> AccessMode {
        match self {
            AccessStrategy::Sequential(_) => AccessMode::Sequential,
            AccessStrategy::Parallel(_) => AccessMode::Parallel,
        }
    }
}

impl ShardAccessStrategy for AccessStrategy {
    fn apply<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        operation: O,
        exit_strategy: E,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: ShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
    {
        match self {
            AccessStrategy::Sequential(s) => s.apply(shards, operation, exit_strategy),
            AccessStrategy::Parallel(s) => s.apply(shards, operation, exit_strategy),
        }
    }

    fn apply_command<C>(&self, shards: &[Arc<Shard>], command: C) -> ShardResult<()>
    where
        C: ShardCommand + 'static,
    {
        match self {
            AccessStrategy::Sequential(s) => s.apply_command(shards, command),
            AccessStrategy::Parallel(s) => s.apply_command(shards, command),
        }
    }
}

#[async_trait]
impl AsyncShardAccessStrategy for AccessStrategy {
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
        E::Output: Send,
    {
        match self {
            AccessStrategy::Sequential(s) => {
                s.apply_async(shards, operation, exit_strategy, cancel).await
            }
            AccessStrategy::Parallel(s) => {
                s.apply_async(shards, operation, exit_strategy, cancel).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_from_config() {
        let config = ShardingConfig::default();
        assert_eq!(
            AccessStrategy::from_config(&config).unwrap().mode(),
            AccessMode::Sequential
        );

        let config = ShardingConfig {
            access_strategy: AccessMode::Parallel,
            worker_threads: 2,
            ..ShardingConfig::default()
        };
        let strategy = AccessStrategy::from_config(&config).unwrap();
        assert_eq!(strategy.mode(), AccessMode::Parallel);
        match strategy {
            AccessStrategy::Parallel(p) => assert_eq!(p.timeout(), config.parallel_timeout()),
            AccessStrategy::Sequential(_) => unreachable!(),
        }
    }
}
