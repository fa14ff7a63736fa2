use log::debug;
use once_cell::sync::OnceCell;
use shardfan_core::{Shard, ShardId, ShardResult};

use super::{CompileGuard, ExitStrategy, MaybeNull};

/// Keeps the first non-null result and halts the fan-out once it has one.
///
/// The winner is decided by an atomic set, so concurrent workers can never
/// both win.
pub struct FirstNonNullResultExitStrategy<R> {
    winner: OnceCell<(R, ShardId)>,
    guard: CompileGuard,
}

impl<R> Default for FirstNonNullResultExitStrategy<R> {
    fn default() -> Self {
        FirstNonNullResultExitStrategy {
            winner: OnceCell::new(),
            guard: CompileGuard::default(),
        }
    }
}

impl<R> FirstNonNullResultExitStrategy<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard whose result won, if any.
    pub fn winning_shard(&self) -> Option<ShardId> {
        self.winner.get().map(|(_, shard)| *shard)
    }
}

impl<R> ExitStrategy<R> for FirstNonNullResultExitStrategy<R>
where
    R: MaybeNull + Clone + Send + Sync,
{
    type Output = Option<R>;

    fn add_result(&self, result: R, shard: &Shard) -> bool {
        if result.is_null_result() {
            return self.winner.get().is_some();
        }
        if self.winner.set((result, shard.primary_id())).is_ok() {
            debug!("[FirstNonNull] Result captured from shard {}", shard.primary_id());
        }
        true
    }

    fn compile_results(&self) -> ShardResult<Option<R>> {
        self.guard.enter("FirstNonNull")?;
        Ok(self.winner.get().map(|(value, _)| value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::shard;
    use shardfan_core::Value;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_null_results_do_not_win() {
        let strategy = FirstNonNullResultExitStrategy::new();
        assert!(!strategy.add_result(Value::Null, &shard(0)));
        assert!(strategy.add_result(Value::I64(8), &shard(1)));
        assert!(strategy.add_result(Value::I64(9), &shard(2)));
        assert_eq!(strategy.winning_shard(), Some(ShardId(1)));
        assert_eq!(strategy.compile_results().unwrap(), Some(Value::I64(8)));
    }

    #[test]
    fn test_empty_compiles_to_none() {
        let strategy = FirstNonNullResultExitStrategy::<Value>::new();
        assert_eq!(strategy.compile_results().unwrap(), None);
    }

    #[test]
    fn test_single_winner_under_concurrency() {
        for _ in 0..50 {
            let strategy = Arc::new(FirstNonNullResultExitStrategy::new());
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8u32)
                .map(|i| {
                    let strategy = Arc::clone(&strategy);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        strategy.add_result(Value::U32(i), &shard(i))
                    })
                })
                .collect();
            for handle in handles {
                assert!(handle.join().unwrap());
            }

            let winner = strategy.winning_shard().unwrap();
            assert_eq!(
                strategy.compile_results().unwrap(),
                Some(Value::U32(winner.as_u32()))
            );
        }
    }
}
