//! Mapping from query projections to cross-shard aggregations.
//!
//! Each shard evaluates the projection locally; the registry decides how the
//! per-shard partial values are combined. Counts merge by summing, averages
//! need the `(average, count)` pair from every shard.

use std::collections::HashMap;

use log::warn;
use shardfan_core::{ShardError, ShardResult};

use crate::aggregation::{AggregateFunction, Aggregation};

/// A projection as written by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Projection {
    /// Named aggregate (`sum`, `count`, ...) over an optional property.
    Aggregate {
        name: String,
        property: Option<String>,
    },
    /// Plain property projection.
    Property(String),
    /// Distinct wrapper around another projection.
    Distinct(Box<Projection>),
}

impl Projection {
    pub fn aggregate(name: impl Into<String>, property: Option<&str>) -> Self {
        Projection::Aggregate {
            name: name.into(),
            property: property.map(str::to_string),
        }
    }

    pub fn distinct(inner: Projection) -> Self {
        Projection::Distinct(Box::new(inner))
    }
}

/// Registry of aggregate names and how their partials merge.
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    merges: HashMap<String, AggregateFunction>,
}

impl ProjectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard aggregates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("sum", AggregateFunction::Sum);
        registry.register("min", AggregateFunction::Min);
        registry.register("max", AggregateFunction::Max);
        registry.register("avg", AggregateFunction::Avg);
        registry.register("count", AggregateFunction::Sum);
        registry.register("row_count", AggregateFunction::Sum);
        registry.register("rowCount", AggregateFunction::Sum);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, merge: AggregateFunction) {
        self.merges.insert(name.into().to_ascii_lowercase(), merge);
    }

    /// Resolves the cross-shard aggregation for a projection.
    ///
    /// Plain property projections resolve to `None`. A distinct aggregate
    /// cannot be merged from per-shard partials and is rejected.
    pub fn resolve(&self, projection: &Projection) -> ShardResult<Option<Aggregation>> {
        match projection {
            Projection::Property(_) => Ok(None),
            Projection::Aggregate { name, .. } => {
                let function = self
                    .merges
                    .get(&name.to_ascii_lowercase())
                    .copied()
                    .ok_or_else(|| {
                        ShardError::Unsupported(format!("no cross-shard merge for '{}'", name))
                    })?;
                // partials are already per-shard results; the property was
                // consumed by the shard-local projection
                Ok(Some(Aggregation::new(function)))
            }
            Projection::Distinct(inner) => match inner.as_ref() {
                Projection::Property(_) => Ok(None),
                other => {
                    warn!("[ProjectionRegistry] Rejecting distinct aggregate {:?}", other);
                    Err(ShardError::Unsupported(
                        "distinct aggregates cannot be merged across shards".into(),
                    ))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_operation::ExitOperation;
    use shardfan_core::Value;

    #[test]
    fn test_count_merges_as_sum() {
        let registry = ProjectionRegistry::with_defaults();
        let agg = registry
            .resolve(&Projection::aggregate("COUNT", None))
            .unwrap()
            .unwrap();
        assert_eq!(agg.function(), AggregateFunction::Sum);

        let op = ExitOperation::builder()
            .projection(&Projection::aggregate("row_count", None), &registry)
            .unwrap()
            .build();
        let per_shard = vec![Value::I64(3), Value::I64(0), Value::I64(9)];
        assert_eq!(op.apply(per_shard).unwrap(), vec![Value::I64(12)]);
    }

    #[test]
    fn test_property_projection_has_no_aggregation() {
        let registry = ProjectionRegistry::with_defaults();
        assert_eq!(registry.resolve(&Projection::Property("name".into())).unwrap(), None);

        let op = ExitOperation::builder()
            .projection(
                &Projection::distinct(Projection::Property("name".into())),
                &registry,
            )
            .unwrap()
            .build();
        assert!(op.is_distinct());
        assert!(op.aggregation().is_none());
    }

    #[test]
    fn test_unknown_and_distinct_aggregates_rejected() {
        let registry = ProjectionRegistry::with_defaults();
        assert!(matches!(
            registry.resolve(&Projection::aggregate("median", Some("x"))),
            Err(ShardError::Unsupported(_))
        ));
        assert!(matches!(
            registry.resolve(&Projection::distinct(Projection::aggregate("count", Some("x")))),
            Err(ShardError::Unsupported(_))
        ));
        assert!(ProjectionRegistry::new()
            .resolve(&Projection::aggregate("sum", None))
            .is_err());
    }
}
