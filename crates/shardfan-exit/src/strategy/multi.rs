use log::warn;
use parking_lot::Mutex;
use shardfan_core::{Shard, ShardError, ShardResult};

use super::ExitStrategy;

/// Exit strategy for batched statements.
///
/// Each shard returns one result per statement; slot `i` feeds sub-strategy
/// `i`. Never halts, since a later statement may still need a shard that an
/// earlier one was satisfied without.
///
/// A shard whose result count differs from the statement count poisons the
/// batch: its results are not routed and compilation fails.
pub struct MultiExitStrategy<R, O> {
    strategies: Vec<Box<dyn ExitStrategy<R, Output = O>>>,
    mismatch: Mutex<Option<String>>,
}

impl<R, O> MultiExitStrategy<R, O> {
    pub fn new(strategies: Vec<Box<dyn ExitStrategy<R, Output = O>>>) -> Self {
        MultiExitStrategy {
            strategies,
            mismatch: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl<R, O> ExitStrategy<Vec<R>> for MultiExitStrategy<R, O> {
    type Output = Vec<O>;

    fn add_result(&self, results: Vec<R>, shard: &Shard) -> bool {
        if results.len() != self.strategies.len() {
            warn!(
                "[MultiExit] Shard {} returned {} results for {} statements",
                shard.primary_id(),
                results.len(),
                self.strategies.len()
            );
            self.mismatch.lock().get_or_insert_with(|| {
                format!(
                    "shard {} returned {} results for {} statements",
                    shard.primary_id(),
                    results.len(),
                    self.strategies.len()
                )
            });
            return false;
        }
        for (strategy, result) in self.strategies.iter().zip(results) {
            strategy.add_result(result, shard);
        }
        false
    }

    fn compile_results(&self) -> ShardResult<Vec<O>> {
        if let Some(message) = self.mismatch.lock().clone() {
            return Err(ShardError::InvalidState(message));
        }
        self.strategies
            .iter()
            .map(|strategy| strategy.compile_results())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::Aggregation;
    use crate::exit_operation::ExitOperation;
    use crate::ordering::{OrderBy, SortDirection};
    use crate::strategy::test_support::shard;
    use crate::strategy::ConcatenateListsExitStrategy;
    use shardfan_core::Value;

    #[test]
    fn test_routes_slots_to_sub_strategies() {
        let statements: Vec<Box<dyn ExitStrategy<Vec<Value>, Output = Vec<Value>>>> = vec![
            Box::new(ConcatenateListsExitStrategy::new(
                ExitOperation::builder()
                    .order_by(OrderBy::by_value(SortDirection::Descending))
                    .build(),
            )),
            Box::new(ConcatenateListsExitStrategy::new(
                ExitOperation::builder().aggregate(Aggregation::sum()).build(),
            )),
        ];
        let strategy = MultiExitStrategy::new(statements);
        assert_eq!(strategy.len(), 2);

        assert!(!strategy.add_result(
            vec![vec![Value::I64(1)], vec![Value::I64(10)]],
            &shard(0)
        ));
        assert!(!strategy.add_result(
            vec![vec![Value::I64(3)], vec![Value::I64(5)]],
            &shard(1)
        ));

        assert_eq!(
            strategy.compile_results().unwrap(),
            vec![
                vec![Value::I64(3), Value::I64(1)],
                vec![Value::I64(15)]
            ]
        );
    }

    #[test]
    fn test_short_shard_result_fails_compile() {
        let statements: Vec<Box<dyn ExitStrategy<Vec<Value>, Output = Vec<Value>>>> = vec![
            Box::new(ConcatenateListsExitStrategy::new(ExitOperation::default())),
            Box::new(ConcatenateListsExitStrategy::new(ExitOperation::default())),
        ];
        let strategy = MultiExitStrategy::new(statements);

        assert!(!strategy.add_result(
            vec![vec![Value::I64(1)], vec![Value::I64(2)]],
            &shard(0)
        ));
        assert!(!strategy.add_result(vec![vec![Value::I64(3)]], &shard(1)));

        match strategy.compile_results() {
            Err(ShardError::InvalidState(message)) => {
                assert!(message.contains("1 results for 2 statements"))
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
