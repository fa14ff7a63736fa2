// Exit operation pipeline
//
// Applied once, after every shard has reported, to the merged result list.
//
// INVARIANTS:
// 1. Stages run in a fixed order: drop nulls, distinct, order, skip, take, aggregate
// 2. Distinct keeps the first occurrence of each value and never reorders
// 3. Skip and take apply to the ordered, de-duplicated sequence, so the
//    outcome does not depend on which shard answered first

use std::collections::HashSet;

use log::debug;
use shardfan_core::{ShardResult, Value};

use crate::aggregation::Aggregation;
use crate::ordering::{compare_rows, OrderBy};
use crate::projection::{Projection, ProjectionRegistry};

/// Post-merge pipeline for one logical query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitOperation {
    distinct: bool,
    order: Vec<OrderBy>,
    first_result: Option<usize>,
    max_results: Option<usize>,
    aggregation: Option<Aggregation>,
}

impl ExitOperation {
    pub fn builder() -> ExitOperationBuilder {
        ExitOperationBuilder::default()
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn order(&self) -> &[OrderBy] {
        &self.order
    }

    pub fn first_result(&self) -> Option<usize> {
        self.first_result
    }

    pub fn max_results(&self) -> Option<usize> {
        self.max_results
    }

    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.aggregation.as_ref()
    }

    /// Whether any stage beyond null-dropping is configured.
    pub fn is_passthrough(&self) -> bool {
        !self.distinct
            && self.order.is_empty()
            && self.first_result.is_none()
            && self.max_results.is_none()
            && self.aggregation.is_none()
    }

    /// Runs the pipeline. An aggregation collapses the output to one element.
    pub fn apply(&self, results: Vec<Value>) -> ShardResult<Vec<Value>> {
        let merged = results.len();
        let mut rows: Vec<Value> = results.into_iter().filter(|v| !v.is_null()).collect();

        if self.distinct {
            let mut seen = HashSet::with_capacity(rows.len());
            rows.retain(|row| seen.insert(row.clone()));
        }

        if !self.order.is_empty() {
            // stable: equal keys keep their distinct-stage order
            rows.sort_by(|a, b| compare_rows(&self.order, a, b));
        }

        if let Some(first) = self.first_result {
            if first >= rows.len() {
                rows.clear();
            } else {
                rows.drain(..first);
            }
        }

        if let Some(max) = self.max_results {
            rows.truncate(max);
        }

        debug!(
            "[ExitOperation] {} merged rows reduced to {}",
            merged,
            rows.len()
        );

        match &self.aggregation {
            Some(aggregation) => Ok(vec![aggregation.apply(rows)?]),
            None => Ok(rows),
        }
    }
}

/// Builder for [`ExitOperation`]; collects the query modifiers that must be
/// re-applied across shards.
#[derive(Debug, Clone, Default)]
pub struct ExitOperationBuilder {
    operation: ExitOperation,
}

impl ExitOperationBuilder {
    pub fn distinct(mut self) -> Self {
        self.operation.distinct = true;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.operation.order.push(order);
        self
    }

    pub fn first_result(mut self, first: usize) -> Self {
        self.operation.first_result = Some(first);
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.operation.max_results = Some(max);
        self
    }

    pub fn aggregate(mut self, aggregation: Aggregation) -> Self {
        self.operation.aggregation = Some(aggregation);
        self
    }

    /// Translates a query projection through the registry.
    ///
    /// A distinct projection marks the pipeline distinct; plain property
    /// projections need no cross-shard aggregation.
    pub fn projection(
        mut self,
        projection: &Projection,
        registry: &ProjectionRegistry,
    ) -> ShardResult<Self> {
        if let Projection::Distinct(_) = projection {
            self.operation.distinct = true;
        }
        if let Some(aggregation) = registry.resolve(projection)? {
            self.operation.aggregation = Some(aggregation);
        }
        Ok(self)
    }

    pub fn build(self) -> ExitOperation {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::SortDirection;
    use proptest::prelude::*;
    use shardfan_core::Entity;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::I64).collect()
    }

    #[test]
    fn test_distinct_then_order_then_page() {
        let op = ExitOperation::builder()
            .distinct()
            .order_by(OrderBy::by_value(SortDirection::Ascending))
            .first_result(1)
            .max_results(2)
            .build();
        let merged = vec![
            Value::I64(5),
            Value::Null,
            Value::I64(1),
            Value::I64(5),
            Value::I64(3),
            Value::I64(2),
        ];
        assert_eq!(op.apply(merged).unwrap(), ints(&[2, 3]));
    }

    #[test]
    fn test_skip_past_end_is_empty() {
        let op = ExitOperation::builder().first_result(10).build();
        assert!(op.apply(ints(&[1, 2, 3])).unwrap().is_empty());

        let op = ExitOperation::builder().max_results(0).build();
        assert!(op.apply(ints(&[1])).unwrap().is_empty());
    }

    #[test]
    fn test_distinct_keeps_first_occurrence_order() {
        let op = ExitOperation::builder().distinct().build();
        assert_eq!(op.apply(ints(&[3, 1, 3, 2, 1])).unwrap(), ints(&[3, 1, 2]));
    }

    #[test]
    fn test_aggregation_runs_after_paging() {
        let op = ExitOperation::builder()
            .order_by(OrderBy::by_value(SortDirection::Descending))
            .max_results(2)
            .aggregate(Aggregation::sum())
            .build();
        assert_eq!(op.apply(ints(&[1, 4, 2, 3])).unwrap(), ints(&[7]));
    }

    #[test]
    fn test_ordering_entities_by_property() {
        let row = |id: i64, city: &str| {
            Value::Entity(Entity::new("Customer").with("id", id).with("city", city))
        };
        let op = ExitOperation::builder()
            .order_by(OrderBy::asc("city"))
            .order_by(OrderBy::desc("id"))
            .build();
        let out = op
            .apply(vec![row(1, "Oslo"), row(2, "Bern"), row(3, "Oslo")])
            .unwrap();
        assert_eq!(out, vec![row(2, "Bern"), row(3, "Oslo"), row(1, "Oslo")]);
    }

    #[test]
    fn test_passthrough_only_drops_nulls() {
        let op = ExitOperation::default();
        assert!(op.is_passthrough());
        assert_eq!(
            op.apply(vec![Value::I64(2), Value::Null, Value::I64(1)]).unwrap(),
            ints(&[2, 1])
        );
    }

    proptest! {
        #[test]
        fn prop_result_independent_of_shard_arrival_order(
            mut values in proptest::collection::vec(proptest::option::of(-20i64..20), 0..40),
            first in 0usize..10,
            max in 0usize..10,
            seed in any::<u64>(),
        ) {
            let op = ExitOperation::builder()
                .distinct()
                .order_by(OrderBy::by_value(SortDirection::Descending))
                .first_result(first)
                .max_results(max)
                .build();

            let as_values = |vs: &[Option<i64>]| -> Vec<Value> {
                vs.iter().map(|v| Value::from(*v)).collect()
            };
            let expected = op.apply(as_values(&values)).unwrap();

            // deterministic shuffle from the seed
            let mut state = seed | 1;
            for i in (1..values.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                values.swap(i, j);
            }
            prop_assert_eq!(op.apply(as_values(&values)).unwrap(), expected);
        }
    }
}
