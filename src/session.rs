// Sharded session: one logical session over every shard
//
// INVARIANTS:
// 1. Each session owns fresh Shard handles; no shard session is shared across logical sessions
// 2. At most one live ShardedTransaction per session
// 3. close() closes every established shard session exactly once
// 5. close() rolls back a transaction that is active or failed to commit
// 4. Every operation after close() fails with InvalidState

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shardfan_access::{AccessStrategy, AsyncShardAccessStrategy, ShardAccessStrategy};
use shardfan_core::{
    AsyncShardOperation, Entity, IsolationLevel, Shard, ShardCommand, ShardError, ShardId,
    ShardOperation, ShardResult, ShardSession, Value,
};
use shardfan_exit::{
    Aggregation, ConcatenateListsExitStrategy, ExecuteUpdateExitStrategy, ExitOperation,
    ExitStrategy, FirstNonNullResultExitStrategy, MaybeNull, MultiExitStrategy,
    UniqueResultExitStrategy,
};
use shardfan_txn::{ShardedTransaction, TransactionState};
use tokio_util::sync::CancellationToken;

use crate::selection::ShardSelectionStrategy;

type ListExitStrategy = Box<dyn ExitStrategy<Vec<Value>, Output = Vec<Value>>>;

pub struct ShardedSession {
    shards: Vec<Arc<Shard>>,
    access: Arc<AccessStrategy>,
    selection: Arc<dyn ShardSelectionStrategy>,
    isolation: IsolationLevel,
    transaction: Mutex<Option<Arc<ShardedTransaction>>>,
    closed: AtomicBool,
}

impl ShardedSession {
    pub(crate) fn new(
        shards: Vec<Arc<Shard>>,
        access: Arc<AccessStrategy>,
        selection: Arc<dyn ShardSelectionStrategy>,
        isolation: IsolationLevel,
    ) -> Self {
        debug!("[ShardedSession] Opened over {} shards", shards.len());
        ShardedSession {
            shards,
            access,
            selection,
            isolation,
            transaction: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Shards owning any of the given virtual shard ids, in session order.
    pub fn shards_for(&self, shard_ids: &[ShardId]) -> Vec<Arc<Shard>> {
        self.shards
            .iter()
            .filter(|shard| shard_ids.iter().any(|id| shard.owns(*id)))
            .cloned()
            .collect()
    }

    pub fn access_strategy(&self) -> &AccessStrategy {
        &self.access
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.is_closed() {
            return Err(ShardError::InvalidState("sharded session is closed".into()));
        }
        Ok(())
    }

    /// Concatenates every shard's rows and runs the exit operation over them.
    pub fn list<O>(&self, operation: O, exit_operation: ExitOperation) -> ShardResult<Vec<Value>>
    where
        O: ShardOperation<Vec<Value>> + 'static,
    {
        self.ensure_open()?;
        self.access.apply(
            &self.shards,
            operation,
            ConcatenateListsExitStrategy::new(exit_operation),
        )
    }

    /// Like [`list`](Self::list) but only over the shards owning `shard_ids`.
    pub fn list_on<O>(
        &self,
        shard_ids: &[ShardId],
        operation: O,
        exit_operation: ExitOperation,
    ) -> ShardResult<Vec<Value>>
    where
        O: ShardOperation<Vec<Value>> + 'static,
    {
        self.ensure_open()?;
        let shards = self.shards_for(shard_ids);
        self.access.apply(
            &shards,
            operation,
            ConcatenateListsExitStrategy::new(exit_operation),
        )
    }

    /// Expects at most one non-null result across all shards, unless an
    /// aggregation merges the per-shard partials.
    pub fn unique_result<O>(
        &self,
        operation: O,
        aggregation: Option<Aggregation>,
    ) -> ShardResult<Value>
    where
        O: ShardOperation<Value> + 'static,
    {
        self.ensure_open()?;
        self.access.apply(
            &self.shards,
            operation,
            UniqueResultExitStrategy::new(aggregation),
        )
    }

    /// Returns the first non-null result any shard produces.
    pub fn first_non_null<R, O>(&self, operation: O) -> ShardResult<Option<R>>
    where
        R: MaybeNull + Clone + Send + Sync + 'static,
        O: ShardOperation<R> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply(&self.shards, operation, FirstNonNullResultExitStrategy::new())
    }

    /// Sums the affected-row counts of every shard.
    pub fn execute_update<O>(&self, operation: O) -> ShardResult<u64>
    where
        O: ShardOperation<u64> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply(&self.shards, operation, ExecuteUpdateExitStrategy::new())
    }

    /// Batched list statements: each shard returns one row set per statement.
    pub fn multi_list<O>(
        &self,
        operation: O,
        exit_operations: Vec<ExitOperation>,
    ) -> ShardResult<Vec<Vec<Value>>>
    where
        O: ShardOperation<Vec<Vec<Value>>> + 'static,
    {
        self.ensure_open()?;
        let strategies: Vec<ListExitStrategy> = exit_operations
            .into_iter()
            .map(|exit| Box::new(ConcatenateListsExitStrategy::new(exit)) as ListExitStrategy)
            .collect();
        self.access
            .apply(&self.shards, operation, MultiExitStrategy::new(strategies))
    }

    /// Runs a command on every shard.
    pub fn execute<C>(&self, command: C) -> ShardResult<()>
    where
        C: ShardCommand + 'static,
    {
        self.ensure_open()?;
        self.access.apply_command(&self.shards, command)
    }

    pub async fn list_async<O>(
        &self,
        operation: O,
        exit_operation: ExitOperation,
        cancel: &CancellationToken,
    ) -> ShardResult<Vec<Value>>
    where
        O: AsyncShardOperation<Vec<Value>> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply_async(
                &self.shards,
                operation,
                ConcatenateListsExitStrategy::new(exit_operation),
                cancel,
            )
            .await
    }

    pub async fn unique_result_async<O>(
        &self,
        operation: O,
        aggregation: Option<Aggregation>,
        cancel: &CancellationToken,
    ) -> ShardResult<Value>
    where
        O: AsyncShardOperation<Value> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply_async(
                &self.shards,
                operation,
                UniqueResultExitStrategy::new(aggregation),
                cancel,
            )
            .await
    }

    pub async fn first_non_null_async<R, O>(
        &self,
        operation: O,
        cancel: &CancellationToken,
    ) -> ShardResult<Option<R>>
    where
        R: MaybeNull + Clone + Send + Sync + 'static,
        O: AsyncShardOperation<R> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply_async(
                &self.shards,
                operation,
                FirstNonNullResultExitStrategy::new(),
                cancel,
            )
            .await
    }

    pub async fn execute_update_async<O>(
        &self,
        operation: O,
        cancel: &CancellationToken,
    ) -> ShardResult<u64>
    where
        O: AsyncShardOperation<u64> + 'static,
    {
        self.ensure_open()?;
        self.access
            .apply_async(
                &self.shards,
                operation,
                ExecuteUpdateExitStrategy::new(),
                cancel,
            )
            .await
    }

    /// Saves a new object on the shard picked by the selection strategy.
    ///
    /// Only the selected shard's session is established. `persist` receives
    /// that session and the chosen virtual shard id; the id is returned.
    pub fn save<F>(&self, entity: &Entity, persist: F) -> ShardResult<ShardId>
    where
        F: FnOnce(&Arc<dyn ShardSession>, ShardId) -> ShardResult<()>,
    {
        self.ensure_open()?;
        let shard_id = self.selection.select_shard_for_new_object(entity)?;
        let shard = self
            .shards
            .iter()
            .find(|shard| shard.owns(shard_id))
            .ok_or_else(|| {
                ShardError::InvalidState(format!(
                    "selected shard {} is not part of this session",
                    shard_id
                ))
            })?;

        let session = shard.establish_session()?;
        persist(&session, shard_id)
            .map_err(|err| ShardError::aggregate(format!("save {}", entity.name()), shard_id, err))?;
        debug!("[ShardedSession] Saved {} on shard {}", entity.name(), shard_id);
        Ok(shard_id)
    }

    /// Returns the session's transaction, begun.
    ///
    /// The first call creates it and enlists every shard; later calls return
    /// the same transaction until it commits or rolls back, after which a new
    /// one is created.
    pub fn begin_transaction(&self) -> ShardResult<Arc<ShardedTransaction>> {
        self.ensure_open()?;
        let mut slot = self.transaction.lock();
        let transaction = match slot.as_ref() {
            Some(existing) if !existing.state().is_terminal() => Arc::clone(existing),
            _ => {
                let created = ShardedTransaction::new(self.shards.clone(), self.isolation)?;
                *slot = Some(Arc::clone(&created));
                created
            }
        };
        drop(slot);

        transaction.begin()?;
        Ok(transaction)
    }

    pub fn current_transaction(&self) -> Option<Arc<ShardedTransaction>> {
        self.transaction.lock().clone()
    }

    /// Closes the session.
    ///
    /// An active transaction, or one whose commit failed, is rolled back
    /// first. Every established shard
    /// session is closed even if an earlier close fails; the first failure is
    /// returned. Closing a closed session is a no-op.
    pub fn close(&self) -> ShardResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("[ShardedSession] close() on a closed session ignored");
            return Ok(());
        }

        let mut first_error: Option<ShardError> = None;

        if let Some(transaction) = self.transaction.lock().take() {
            let state = transaction.state();
            if matches!(
                state,
                TransactionState::Active | TransactionState::CommitFailed
            ) {
                warn!(
                    "[ShardedSession] Rolling back transaction {} left {} at close",
                    transaction.id(),
                    state
                );
                if let Err(err) = transaction.rollback() {
                    error!(
                        "[ShardedSession] Rollback of transaction {} failed: {}",
                        transaction.id(),
                        err
                    );
                    first_error.get_or_insert(ShardError::Transaction(err));
                }
            }
        }

        let mut closed = 0usize;
        for shard in &self.shards {
            match shard.close_session() {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(
                        "[ShardedSession] Failed to close session on shard {}: {}",
                        shard.primary_id(),
                        err
                    );
                    first_error.get_or_insert(ShardError::aggregate(
                        "close",
                        shard.primary_id(),
                        err,
                    ));
                }
            }
        }

        info!("[ShardedSession] Closed {} shard sessions", closed);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ShardedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedSession")
            .field("shards", &self.shards.len())
            .field("access", &self.access.mode())
            .field("isolation", &self.isolation)
            .field("closed", &self.is_closed())
            .finish()
    }
}
