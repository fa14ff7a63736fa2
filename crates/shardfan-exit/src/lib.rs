//! shardfan-exit: merging per-shard partial results.
//!
//! An [`ExitStrategy`] accumulates what each shard returns while the access
//! strategy is still fanning out; the stateless [`ExitOperation`] pipeline then
//! reproduces distinct, order, paging and aggregation over the merged rows so
//! the caller sees what a single database would have returned.

pub mod aggregation;
pub mod exit_operation;
pub mod ordering;
pub mod projection;
pub mod strategy;

pub use aggregation::{sum_values, weighted_average, AggregateFunction, Aggregation};
pub use exit_operation::{ExitOperation, ExitOperationBuilder};
pub use ordering::{compare_rows, OrderBy, SortDirection};
pub use projection::{Projection, ProjectionRegistry};
pub use strategy::{
    ConcatenateListsExitStrategy, ExecuteUpdateExitStrategy, ExitStrategy,
    FirstNonNullResultExitStrategy, MaybeNull, MultiExitStrategy, UniqueResultExitStrategy,
};
