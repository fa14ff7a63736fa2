use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::error;
use shardfan_core::{Shard, ShardError, ShardResult};

use super::{CompileGuard, ExitStrategy};

/// Sums affected-row counts reported by each shard.
#[derive(Debug, Default)]
pub struct ExecuteUpdateExitStrategy {
    total: AtomicU64,
    overflowed: AtomicBool,
    guard: CompileGuard,
}

impl ExecuteUpdateExitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExitStrategy<u64> for ExecuteUpdateExitStrategy {
    type Output = u64;

    fn add_result(&self, result: u64, shard: &Shard) -> bool {
        let added = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(result)
            });
        if added.is_err() {
            error!(
                "[ExecuteUpdate] Row count overflow adding {} from shard {}",
                result,
                shard.primary_id()
            );
            self.overflowed.store(true, Ordering::Release);
        }
        false
    }

    fn compile_results(&self) -> ShardResult<u64> {
        self.guard.enter("ExecuteUpdate")?;
        if self.overflowed.load(Ordering::Acquire) {
            return Err(ShardError::Overflow("updated row count exceeds u64".into()));
        }
        Ok(self.total.load(Ordering::Acquire))
    }
}
