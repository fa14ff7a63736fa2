//! Exit strategies: stateful accumulators fed by access strategies.
//!
//! `add_result` may be called concurrently from several workers and returns
//! `true` once further shards cannot change the outcome. `compile_results`
//! is called exactly once, after every worker has quiesced.

mod concatenate;
mod execute_update;
mod first_non_null;
mod multi;
mod unique;

use std::sync::atomic::{AtomicBool, Ordering};

use shardfan_core::{Shard, ShardError, ShardResult, Value};

pub use concatenate::ConcatenateListsExitStrategy;
pub use execute_update::ExecuteUpdateExitStrategy;
pub use first_non_null::FirstNonNullResultExitStrategy;
pub use multi::MultiExitStrategy;
pub use unique::UniqueResultExitStrategy;

pub trait ExitStrategy<R>: Send + Sync {
    type Output;

    /// Records one shard's result. Returns `true` when visiting further
    /// shards is pointless.
    fn add_result(&self, result: R, shard: &Shard) -> bool;

    fn compile_results(&self) -> ShardResult<Self::Output>;
}

impl<R, E> ExitStrategy<R> for Box<E>
where
    E: ExitStrategy<R> + ?Sized,
{
    type Output = E::Output;

    fn add_result(&self, result: R, shard: &Shard) -> bool {
        (**self).add_result(result, shard)
    }

    fn compile_results(&self) -> ShardResult<Self::Output> {
        (**self).compile_results()
    }
}

/// Values that can stand for "no result".
pub trait MaybeNull {
    fn is_null_result(&self) -> bool;
}

impl MaybeNull for Value {
    fn is_null_result(&self) -> bool {
        self.is_null()
    }
}

impl<T> MaybeNull for Option<T> {
    fn is_null_result(&self) -> bool {
        self.is_none()
    }
}

impl<T> MaybeNull for Vec<T> {
    fn is_null_result(&self) -> bool {
        false
    }
}

/// Rejects a second `compile_results` on a consumed accumulator.
#[derive(Debug, Default)]
pub(crate) struct CompileGuard {
    compiled: AtomicBool,
}

impl CompileGuard {
    pub(crate) fn enter(&self, strategy: &str) -> ShardResult<()> {
        if self.compiled.swap(true, Ordering::AcqRel) {
            return Err(ShardError::InvalidState(format!(
                "{} results were already compiled",
                strategy
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use shardfan_core::{
        PhysicalShardId, SessionFactory, Shard, ShardError, ShardId, ShardResult, ShardSession,
    };

    struct UnreachableFactory;

    impl SessionFactory for UnreachableFactory {
        fn open_session(&self, _ids: &BTreeSet<ShardId>) -> ShardResult<Arc<dyn ShardSession>> {
            Err(ShardError::Session("exit strategy tests never open sessions".into()))
        }
    }

    pub(crate) fn shard(id: u32) -> Shard {
        let _ = env_logger::builder().is_test(true).try_init();
        Shard::new(
            PhysicalShardId(id),
            BTreeSet::from([ShardId(id)]),
            Arc::new(UnreachableFactory),
        )
        .unwrap()
    }
}
