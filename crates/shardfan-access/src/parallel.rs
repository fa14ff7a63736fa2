// Parallel access strategy on a rayon worker pool
//
// INVARIANTS:
// 1. One fire-and-forget task per shard; preparation is serialized behind the
//    operation lock, execution of the prepared work is not
// 2. A single deadline bounds the whole fan-out; it is fixed before dispatch
// 3. The first failure or a halt from the exit strategy sets the shared
//    cancellation flag; tasks that have not prepared yet skip their shard and
//    results arriving after the flag is set are discarded
// 4. Only the first failure is surfaced, and only after every task has
//    finished; later failures are logged
// 5. compile_results runs at most once, and only when no failure was captured
// 6. The async fan-out follows the same rules: each task prepares its own
//    shard and feeds the exit strategy itself

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use shardfan_core::{
    AsyncShardOperation, Shard, ShardCommand, ShardError, ShardId, ShardOperation, ShardResult,
    DEFAULT_PARALLEL_TIMEOUT,
};
use shardfan_exit::ExitStrategy;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::access::{AsyncShardAccessStrategy, ShardAccessStrategy};
use crate::command::{CommandOperation, DiscardExitStrategy};

pub struct ParallelShardAccessStrategy {
    pool: rayon::ThreadPool,
    timeout: Duration,
}

impl ParallelShardAccessStrategy {
    pub fn new(worker_threads: usize, timeout: Duration) -> ShardResult<Self> {
        if timeout.is_zero() {
            return Err(ShardError::Config("parallel timeout must be positive".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|idx| format!("shardfan-worker-{}", idx))
            .build()
            .map_err(|e| ShardError::ThreadPool(e.to_string()))?;
        info!(
            "[ParallelAccess] Worker pool ready: {} threads, timeout {:?}",
            pool.current_num_threads(),
            timeout
        );
        Ok(ParallelShardAccessStrategy { pool, timeout })
    }

    /// Pool sized to the machine with the default 30s deadline.
    pub fn with_defaults() -> ShardResult<Self> {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(threads, DEFAULT_PARALLEL_TIMEOUT)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// State shared by every task of one fan-out.
struct FanOut {
    remaining: Mutex<usize>,
    finished: Condvar,
    cancelled: AtomicBool,
    first_error: Mutex<Option<(ShardId, ShardError)>>,
}

impl FanOut {
    fn new(tasks: usize) -> Self {
        FanOut {
            remaining: Mutex::new(tasks),
            finished: Condvar::new(),
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Records a failure; only a failure seen before cancellation is kept.
    fn fail(&self, operation: &str, shard: ShardId, err: ShardError) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            warn!(
                "[ParallelAccess] `{}` failed on shard {} after cancellation: {}",
                operation, shard, err
            );
            return;
        }
        error!(
            "[ParallelAccess] `{}` failed on shard {}: {}",
            operation, shard, err
        );
        *self.first_error.lock() = Some((shard, err));
    }

    /// Blocks until every task has finished or the deadline passes.
    /// Returns `false` on timeout.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.finished.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}

/// Counts a task as finished when dropped, panics included.
struct Countdown<'a>(&'a FanOut);

impl Drop for Countdown<'_> {
    fn drop(&mut self) {
        let mut remaining = self.0.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.0.finished.notify_all();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_shard<R, O, E>(
    fan_out: &FanOut,
    operation: &Mutex<O>,
    exit_strategy: &E,
    shard: &Shard,
) -> ShardResult<()>
where
    O: ShardOperation<R>,
    E: ExitStrategy<R>,
{
    let work = {
        let mut operation = operation.lock();
        if fan_out.is_cancelled() {
            debug!(
                "[ParallelAccess] Skipping shard {}: fan-out cancelled",
                shard.primary_id()
            );
            return Ok(());
        }
        operation.prepare(shard)?
    };

    let result = work()?;

    if fan_out.is_cancelled() {
        debug!(
            "[ParallelAccess] Discarding result of shard {}: fan-out cancelled",
            shard.primary_id()
        );
        return Ok(());
    }
    if let Some(result) = result {
        if exit_strategy.add_result(result, shard) {
            debug!(
                "[ParallelAccess] Exit strategy satisfied by shard {}",
                shard.primary_id()
            );
            fan_out.cancel();
        }
    }
    Ok(())
}

impl ShardAccessStrategy for ParallelShardAccessStrategy {
    fn apply<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        operation: O,
        exit_strategy: E,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: ShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
    {
        let name: Arc<str> = Arc::from(operation.operation_name());
        let operation = Arc::new(Mutex::new(operation));
        let exit_strategy = Arc::new(exit_strategy);
        let fan_out = Arc::new(FanOut::new(shards.len()));
        let deadline = Instant::now() + self.timeout;

        debug!(
            "[ParallelAccess] Dispatching `{}` to {} shards",
            name,
            shards.len()
        );

        for shard in shards {
            let shard = Arc::clone(shard);
            let operation = Arc::clone(&operation);
            let exit_strategy = Arc::clone(&exit_strategy);
            let fan_out = Arc::clone(&fan_out);
            let name = Arc::clone(&name);

            self.pool.spawn(move || {
                let _countdown = Countdown(&fan_out);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_shard::<R, O, E>(&fan_out, &operation, &*exit_strategy, &shard)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => fan_out.fail(&name, shard.primary_id(), err),
                    Err(payload) => {
                        let err = ShardError::WorkerPanicked {
                            operation: name.to_string(),
                            shard: shard.primary_id(),
                            message: panic_message(payload),
                        };
                        fan_out.fail(&name, shard.primary_id(), err);
                    }
                }
            });
        }

        if !fan_out.wait_until(deadline) {
            fan_out.cancel();
            error!(
                "[ParallelAccess] `{}` timed out after {:?}",
                name, self.timeout
            );
            return Err(ShardError::Timeout {
                operation: name.to_string(),
                timeout: self.timeout,
            });
        }

        let first_error = fan_out.first_error.lock().take();
        if let Some((shard, err)) = first_error {
            return Err(ShardError::aggregate(name.to_string(), shard, err));
        }

        exit_strategy.compile_results()
    }

    fn apply_command<C>(&self, shards: &[Arc<Shard>], command: C) -> ShardResult<()>
    where
        C: ShardCommand + 'static,
    {
        self.apply(shards, CommandOperation::new(command), DiscardExitStrategy)
    }
}

/// State shared by the tasks of one async fan-out.
struct AsyncFanOut {
    /// Child of the caller's token; cancelled by a halt, a failure or the caller.
    token: CancellationToken,
    stopped: AtomicBool,
    satisfied: AtomicBool,
    first_error: Mutex<Option<(ShardId, ShardError)>>,
}

impl AsyncFanOut {
    fn new(token: CancellationToken) -> Self {
        AsyncFanOut {
            token,
            stopped: AtomicBool::new(false),
            satisfied: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.token.is_cancelled()
    }

    fn halt(&self) {
        self.satisfied.store(true, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        self.token.cancel();
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// Records a failure; only a failure seen before cancellation is kept.
    fn fail(&self, operation: &str, shard: ShardId, err: ShardError) {
        if self.stopped.swap(true, Ordering::AcqRel) || self.token.is_cancelled() {
            warn!(
                "[ParallelAccess] `{}` failed on shard {} after cancellation: {}",
                operation, shard, err
            );
            return;
        }
        error!(
            "[ParallelAccess] `{}` failed on shard {}: {}",
            operation, shard, err
        );
        *self.first_error.lock() = Some((shard, err));
        self.token.cancel();
    }
}

async fn run_shard_async<R, O, E>(
    fan_out: &AsyncFanOut,
    operation: &Mutex<O>,
    exit_strategy: &E,
    shard: &Shard,
    name: &str,
) where
    O: AsyncShardOperation<R>,
    E: ExitStrategy<R>,
{
    if fan_out.is_cancelled() {
        debug!(
            "[ParallelAccess] Skipping shard {}: fan-out cancelled",
            shard.primary_id()
        );
        return;
    }

    let prepared = panic::catch_unwind(AssertUnwindSafe(|| operation.lock().prepare(shard)));
    let work = match prepared {
        Ok(Ok(work)) => work,
        Ok(Err(err)) => return fan_out.fail(name, shard.primary_id(), err),
        Err(payload) => {
            let err = ShardError::WorkerPanicked {
                operation: name.to_string(),
                shard: shard.primary_id(),
                message: panic_message(payload),
            };
            return fan_out.fail(name, shard.primary_id(), err);
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = fan_out.token.cancelled() => None,
        outcome = AssertUnwindSafe(work).catch_unwind() => Some(outcome),
    };
    let Some(outcome) = outcome else {
        return;
    };

    match outcome {
        Ok(Ok(Some(result))) => {
            if fan_out.is_cancelled() {
                debug!(
                    "[ParallelAccess] Discarding result of shard {}: fan-out cancelled",
                    shard.primary_id()
                );
            } else if exit_strategy.add_result(result, shard) {
                debug!(
                    "[ParallelAccess] Exit strategy satisfied by shard {}",
                    shard.primary_id()
                );
                fan_out.halt();
            }
        }
        Ok(Ok(None)) => {}
        Ok(Err(err)) => fan_out.fail(name, shard.primary_id(), err),
        Err(payload) => {
            let err = ShardError::WorkerPanicked {
                operation: name.to_string(),
                shard: shard.primary_id(),
                message: panic_message(payload),
            };
            fan_out.fail(name, shard.primary_id(), err);
        }
    }
}

#[async_trait]
impl AsyncShardAccessStrategy for ParallelShardAccessStrategy {
    async fn apply_async<R, O, E>(
        &self,
        shards: &[Arc<Shard>],
        operation: O,
        exit_strategy: E,
        cancel: &CancellationToken,
    ) -> ShardResult<E::Output>
    where
        R: Send + 'static,
        O: AsyncShardOperation<R> + 'static,
        E: ExitStrategy<R> + 'static,
        E::Output: Send,
    {
        let name: Arc<str> = Arc::from(operation.operation_name());
        let operation = Arc::new(Mutex::new(operation));
        let exit_strategy = Arc::new(exit_strategy);
        let fan_out = Arc::new(AsyncFanOut::new(cancel.child_token()));
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut tasks = JoinSet::new();

        for shard in shards {
            let shard = Arc::clone(shard);
            let operation = Arc::clone(&operation);
            let exit_strategy = Arc::clone(&exit_strategy);
            let fan_out = Arc::clone(&fan_out);
            let name = Arc::clone(&name);
            tasks.spawn(async move {
                run_shard_async::<R, O, E>(&fan_out, &operation, &*exit_strategy, &shard, &name)
                    .await;
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(join_error))) => {
                    debug!("[ParallelAccess] Shard task ended early: {}", join_error);
                }
                Ok(None) => break,
                Err(_) => {
                    fan_out.stop();
                    tasks.abort_all();
                    error!(
                        "[ParallelAccess] `{}` timed out after {:?}",
                        name, self.timeout
                    );
                    return Err(ShardError::Timeout {
                        operation: name.to_string(),
                        timeout: self.timeout,
                    });
                }
            }
        }

        if cancel.is_cancelled() && !fan_out.satisfied.load(Ordering::Acquire) {
            return Err(ShardError::Cancelled {
                operation: name.to_string(),
            });
        }
        let first_error = fan_out.first_error.lock().take();
        if let Some((shard, err)) = first_error {
            return Err(ShardError::aggregate(name.to_string(), shard, err));
        }
        exit_strategy.compile_results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequential::SequentialShardAccessStrategy;
    use crate::test_support::{list_op, shards, value_op};
    use shardfan_core::{async_operation_fn, Value};
    use shardfan_exit::{
        ConcatenateListsExitStrategy, ExecuteUpdateExitStrategy, ExitOperation,
        FirstNonNullResultExitStrategy, OrderBy, SortDirection,
    };
    use std::sync::atomic::AtomicUsize;

    fn strategy(threads: usize, timeout_ms: u64) -> ParallelShardAccessStrategy {
        ParallelShardAccessStrategy::new(threads, Duration::from_millis(timeout_ms)).unwrap()
    }

    #[test]
    fn test_matches_sequential_output() {
        let shards = shards(6);
        let exit = || {
            ConcatenateListsExitStrategy::new(
                ExitOperation::builder()
                    .distinct()
                    .order_by(OrderBy::by_value(SortDirection::Ascending))
                    .first_result(2)
                    .max_results(5)
                    .build(),
            )
        };
        let rows = |id: u32| vec![Value::U32(id * 3 % 7), Value::U32(id), Value::U32(9)];

        let parallel = strategy(4, 5_000)
            .apply(&shards, list_op("list", rows), exit())
            .unwrap();
        let sequential = SequentialShardAccessStrategy::new()
            .apply(&shards, list_op("list", rows), exit())
            .unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.len(), 5);
    }

    #[test]
    fn test_execute_update_sums_across_workers() {
        let shards = shards(3);
        let counts = [3u64, 0, 7];
        let op = shardfan_core::operation_fn("update", move |shard: &Shard| {
            let count = counts[shard.primary_id().as_u32() as usize];
            Ok(Box::new(move || Ok(Some(count))) as shardfan_core::PreparedWork<u64>)
        });
        let total = strategy(3, 5_000)
            .apply(&shards, op, ExecuteUpdateExitStrategy::new())
            .unwrap();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_timeout_names_operation() {
        let shards = shards(2);
        let op = value_op("slow_lookup", |_| {
            std::thread::sleep(Duration::from_millis(1_500));
            Some(Value::Bool(true))
        });
        let started = Instant::now();
        let err = strategy(2, 100)
            .apply(&shards, op, FirstNonNullResultExitStrategy::new())
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(1_000));
        match err {
            ShardError::Timeout { operation, timeout } => {
                assert_eq!(operation, "slow_lookup");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_halt_skips_shards_not_yet_started() {
        let shards = shards(5);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let op = value_op("find", move |id| {
            counter.fetch_add(1, Ordering::SeqCst);
            (id == 2).then_some(Value::U32(id))
        });

        // single worker: shards start strictly one after another
        let result = strategy(1, 5_000)
            .apply(&shards, op, FirstNonNullResultExitStrategy::new())
            .unwrap();
        assert_eq!(result, Some(Value::U32(2)));
        assert!(ran.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_first_error_wins_and_results_are_discarded() {
        let shards = shards(4);
        let op = shardfan_core::operation_fn("list", |shard: &Shard| {
            let id = shard.primary_id().as_u32();
            Ok(Box::new(move || {
                if id == 1 {
                    Err(ShardError::Operation("lost connection".into()))
                } else {
                    Ok(Some(vec![Value::U32(id)]))
                }
            }) as shardfan_core::PreparedWork<Vec<Value>>)
        });
        let err = strategy(1, 5_000)
            .apply(
                &shards,
                op,
                ConcatenateListsExitStrategy::new(ExitOperation::default()),
            )
            .unwrap_err();
        match err {
            ShardError::AggregateOperation {
                operation, shard, source,
            } => {
                assert_eq!(operation, "list");
                assert_eq!(shard.as_u32(), 1);
                assert!(matches!(*source, ShardError::Operation(_)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let shards = shards(2);
        let op = value_op("explode", |id| {
            if id == 0 {
                panic!("shard driver bug");
            }
            None
        });
        let err = strategy(2, 5_000)
            .apply(&shards, op, FirstNonNullResultExitStrategy::new())
            .unwrap_err();
        match err {
            ShardError::AggregateOperation { source, .. } => match *source {
                ShardError::WorkerPanicked { message, .. } => {
                    assert!(message.contains("shard driver bug"))
                }
                other => panic!("unexpected source {:?}", other),
            },
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_empty_shard_set_compiles_immediately() {
        let result = strategy(1, 100)
            .apply(
                &[],
                list_op("list", |_| Vec::new()),
                ConcatenateListsExitStrategy::new(ExitOperation::default()),
            )
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_async_parallel_satisfied_is_not_an_error() {
        let shards = shards(4);
        let op = async_operation_fn("find_async", |shard: &Shard| {
            let id = shard.primary_id().as_u32();
            Ok(async move {
                if id == 0 {
                    Ok::<_, ShardError>(Some(Value::U32(id)))
                } else {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(None)
                }
            }
            .boxed())
        });

        let cancel = CancellationToken::new();
        let result = strategy(1, 5_000)
            .apply_async(&shards, op, FirstNonNullResultExitStrategy::new(), &cancel)
            .await
            .unwrap();
        assert_eq!(result, Some(Value::U32(0)));
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_async_parallel_halt_stops_preparation() {
        let shards = shards(5);
        let prepared = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&prepared);
        let op = async_operation_fn("find_async", move |shard: &Shard| {
            counter.fetch_add(1, Ordering::SeqCst);
            let id = shard.primary_id().as_u32();
            Ok(async move {
                if id == 0 {
                    Ok::<_, ShardError>(Some(Value::U32(id)))
                } else {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(None)
                }
            }
            .boxed())
        });

        let result = strategy(1, 5_000)
            .apply_async(
                &shards,
                op,
                FirstNonNullResultExitStrategy::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(Value::U32(0)));
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_parallel_timeout() {
        let shards = shards(2);
        let op = async_operation_fn("stuck", |_shard: &Shard| {
            Ok(futures::future::pending::<ShardResult<Option<Value>>>().boxed())
        });
        let err = strategy(1, 50)
            .apply_async(
                &shards,
                op,
                FirstNonNullResultExitStrategy::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_async_parallel_caller_cancel() {
        let shards = shards(3);
        let op = async_operation_fn("stuck", |_shard: &Shard| {
            Ok(futures::future::pending::<ShardResult<Option<Value>>>().boxed())
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = strategy(1, 5_000)
            .apply_async(&shards, op, FirstNonNullResultExitStrategy::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_async_parallel_first_error() {
        let shards = shards(3);
        let op = async_operation_fn("count", |shard: &Shard| {
            let id = shard.primary_id().as_u32();
            Ok(async move {
                if id == 2 {
                    Err(ShardError::Operation("syntax error".into()))
                } else {
                    Ok(Some(1u64))
                }
            }
            .boxed())
        });
        let err = strategy(1, 5_000)
            .apply_async(
                &shards,
                op,
                ExecuteUpdateExitStrategy::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardError::AggregateOperation { shard, .. } if shard.as_u32() == 2
        ));
    }
}
