//! shardfan-access: running one operation against many shards.
//!
//! The sequential strategy walks shards on the calling thread and stops as
//! soon as the exit strategy is satisfied. The parallel strategy fans out to a
//! rayon pool (or to tokio tasks for async operations) under one deadline,
//! with a shared cancellation flag and first-error-wins reporting.

pub mod access;
mod command;
pub mod dispatch;
pub mod ordering;
pub mod parallel;
pub mod sequential;

pub use access::{AsyncShardAccessStrategy, ShardAccessStrategy};
pub use dispatch::AccessStrategy;
pub use ordering::{IterationOrder, RoundRobinOrdering, ShardOrdering};
pub use parallel::ParallelShardAccessStrategy;
pub use sequential::SequentialShardAccessStrategy;
