use log::debug;
use parking_lot::Mutex;
use shardfan_core::{Shard, ShardResult, Value};

use super::{CompileGuard, ExitStrategy};
use crate::exit_operation::ExitOperation;

/// Concatenates per-shard lists and runs the exit operation over the whole.
///
/// Each shard's list is kept as its own chunk; flattening is deferred to
/// compile time.
pub struct ConcatenateListsExitStrategy {
    exit_operation: ExitOperation,
    chunks: Mutex<Vec<Vec<Value>>>,
    guard: CompileGuard,
}

impl ConcatenateListsExitStrategy {
    pub fn new(exit_operation: ExitOperation) -> Self {
        ConcatenateListsExitStrategy {
            exit_operation,
            chunks: Mutex::new(Vec::new()),
            guard: CompileGuard::default(),
        }
    }

    /// Number of shards that contributed a list.
    pub fn contributions(&self) -> usize {
        self.chunks.lock().len()
    }
}

impl ExitStrategy<Vec<Value>> for ConcatenateListsExitStrategy {
    type Output = Vec<Value>;

    fn add_result(&self, result: Vec<Value>, shard: &Shard) -> bool {
        debug!(
            "[ConcatenateLists] {} rows from shard {}",
            result.len(),
            shard.primary_id()
        );
        self.chunks.lock().push(result);
        false
    }

    fn compile_results(&self) -> ShardResult<Vec<Value>> {
        self.guard.enter("ConcatenateLists")?;
        let chunks = std::mem::take(&mut *self.chunks.lock());
        let merged: Vec<Value> = chunks.into_iter().flatten().collect();
        self.exit_operation.apply(merged)
    }
}
