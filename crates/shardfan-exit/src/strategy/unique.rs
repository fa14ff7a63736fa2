use log::warn;
use parking_lot::Mutex;
use shardfan_core::{Shard, ShardError, ShardId, ShardResult, Value};

use super::{CompileGuard, ExitStrategy};
use crate::aggregation::Aggregation;

#[derive(Default)]
struct UniqueState {
    results: Vec<Value>,
    first_shard: Option<ShardId>,
}

/// Expects at most one non-null result across all shards.
///
/// With an aggregation configured the partial results are folded into one
/// scalar instead, so several contributions are legitimate.
pub struct UniqueResultExitStrategy {
    aggregation: Option<Aggregation>,
    default: Value,
    state: Mutex<UniqueState>,
    guard: CompileGuard,
}

impl Default for UniqueResultExitStrategy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl UniqueResultExitStrategy {
    pub fn new(aggregation: Option<Aggregation>) -> Self {
        UniqueResultExitStrategy {
            aggregation,
            default: Value::Null,
            state: Mutex::new(UniqueState::default()),
            guard: CompileGuard::default(),
        }
    }

    /// Value returned when no shard produced a result.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    /// Shard that produced the first non-null result.
    pub fn first_shard(&self) -> Option<ShardId> {
        self.state.lock().first_shard
    }
}

impl ExitStrategy<Value> for UniqueResultExitStrategy {
    type Output = Value;

    fn add_result(&self, result: Value, shard: &Shard) -> bool {
        if result.is_null() {
            return false;
        }
        let mut state = self.state.lock();
        state.first_shard.get_or_insert(shard.primary_id());
        state.results.push(result);
        false
    }

    fn compile_results(&self) -> ShardResult<Value> {
        self.guard.enter("UniqueResult")?;
        let results = std::mem::take(&mut self.state.lock().results);

        if let Some(aggregation) = &self.aggregation {
            return aggregation.apply(results);
        }

        match results.len() {
            0 => Ok(self.default.clone()),
            1 => Ok(results.into_iter().next().unwrap_or(Value::Null)),
            count => {
                warn!("[UniqueResult] {} shards returned a result", count);
                Err(ShardError::NonUniqueResult { count })
            }
        }
    }
}
