// Sharded transaction coordinator
//
// INVARIANTS:
// 1. Begin is all-or-nothing: if any shard fails to begin, every shard that
//    did begin is rolled back and the coordinator stays NotBegun
// 2. Commit and rollback attempt every shard; only the first failure of the
//    phase is reported
// 3. A failed commit forbids any further begin
// 4. Committed and RolledBack are terminal; every operation on a completed
//    transaction fails fast
// 5. A shard whose session is established while the coordinator is Active
//    begins its local transaction immediately
// 6. If that late begin fails, commit is refused for good; only rollback
//    remains allowed

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardfan_core::{
    IsolationLevel, Shard, ShardId, ShardResult, ShardSession, ShardTransaction, TransactionError,
    TransactionPhase,
};
use uuid::Uuid;

use crate::synchronization::TransactionSynchronization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    NotBegun,
    Active,
    Committed,
    RolledBack,
    /// At least one shard failed to commit. Only rollback is allowed.
    CommitFailed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::NotBegun => "not begun",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
            TransactionState::CommitFailed => "commit failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a coordinator, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub id: Uuid,
    pub state: TransactionState,
    pub enlisted_shards: Vec<ShardId>,
    pub active_shards: usize,
}

struct Enlisted {
    shard: ShardId,
    transaction: Arc<dyn ShardTransaction>,
}

struct CoordinatorState {
    state: TransactionState,
    transactions: Vec<Enlisted>,
    /// First shard that joined while active but could not begin.
    failed_enlistment: Option<(ShardId, String)>,
}

/// One logical transaction spanning every shard of a sharded session.
pub struct ShardedTransaction {
    id: Uuid,
    isolation: IsolationLevel,
    shards: Vec<Arc<Shard>>,
    inner: Mutex<CoordinatorState>,
    synchronizations: Mutex<Vec<Arc<dyn TransactionSynchronization>>>,
}

fn phase_error(phase: TransactionPhase, shard: ShardId, err: TransactionError) -> TransactionError {
    TransactionError::Phase {
        phase,
        shard,
        source: Box::new(err),
    }
}

impl ShardedTransaction {
    /// Creates the coordinator and enlists every shard: established shards
    /// right away, the others when their session is established.
    pub fn new(shards: Vec<Arc<Shard>>, isolation: IsolationLevel) -> ShardResult<Arc<Self>> {
        let transaction = Arc::new(ShardedTransaction {
            id: Uuid::new_v4(),
            isolation,
            shards,
            inner: Mutex::new(CoordinatorState {
                state: TransactionState::NotBegun,
                transactions: Vec::new(),
                failed_enlistment: None,
            }),
            synchronizations: Mutex::new(Vec::new()),
        });

        for shard in &transaction.shards {
            let shard_id = shard.primary_id();
            shard.on_establish_weak(
                &transaction,
                move |coordinator: Arc<ShardedTransaction>, session: &Arc<dyn ShardSession>| {
                    coordinator.enlist_session(shard_id, session)?;
                    Ok(())
                },
            )?;
        }

        info!(
            "[ShardedTransaction] Created transaction {} over {} shards",
            transaction.id,
            transaction.shards.len()
        );
        Ok(transaction)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    pub fn was_committed(&self) -> bool {
        self.state() == TransactionState::Committed
    }

    pub fn was_rolled_back(&self) -> bool {
        self.state() == TransactionState::RolledBack
    }

    pub fn snapshot(&self) -> TransactionSnapshot {
        let inner = self.inner.lock();
        TransactionSnapshot {
            id: self.id,
            state: inner.state,
            enlisted_shards: inner.transactions.iter().map(|t| t.shard).collect(),
            active_shards: inner
                .transactions
                .iter()
                .filter(|t| t.transaction.is_active())
                .count(),
        }
    }

    /// Called when a shard session is established.
    fn enlist_session(
        &self,
        shard: ShardId,
        session: &Arc<dyn ShardSession>,
    ) -> Result<(), TransactionError> {
        let transaction = session.transaction();
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::NotBegun => {}
            TransactionState::Active => {
                if let Err(err) = transaction.begin(self.isolation) {
                    error!(
                        "[ShardedTransaction] {} could not begin late-enlisted shard {}: {}",
                        self.id, shard, err
                    );
                    inner
                        .failed_enlistment
                        .get_or_insert_with(|| (shard, err.to_string()));
                    return Err(phase_error(TransactionPhase::Begin, shard, err));
                }
                info!(
                    "[ShardedTransaction] {} began late-enlisted shard {}",
                    self.id, shard
                );
            }
            state => {
                warn!(
                    "[ShardedTransaction] {} is {}; not enlisting shard {}",
                    self.id, state, shard
                );
                return Ok(());
            }
        }
        inner.transactions.push(Enlisted { shard, transaction });
        Ok(())
    }

    /// Begins every enlisted shard transaction. A no-op when already active.
    pub fn begin(&self) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::NotBegun => {}
            TransactionState::Active => {
                debug!("[ShardedTransaction] {} already active", self.id);
                return Ok(());
            }
            TransactionState::CommitFailed => {
                return Err(TransactionError::InvalidState(format!(
                    "transaction {} cannot begin after a failed commit",
                    self.id
                )));
            }
            state => {
                return Err(TransactionError::InvalidState(format!(
                    "transaction {} is already {}",
                    self.id, state
                )));
            }
        }

        let mut begun: Vec<&Enlisted> = Vec::with_capacity(inner.transactions.len());
        for enlisted in &inner.transactions {
            if let Err(err) = enlisted.transaction.begin(self.isolation) {
                error!(
                    "[ShardedTransaction] {} failed to begin on shard {}: {}",
                    self.id, enlisted.shard, err
                );
                for started in begun {
                    if let Err(rollback_err) = started.transaction.rollback() {
                        warn!(
                            "[ShardedTransaction] {} could not undo begin on shard {}: {}",
                            self.id, started.shard, rollback_err
                        );
                    }
                }
                return Err(phase_error(TransactionPhase::Begin, enlisted.shard, err));
            }
            begun.push(enlisted);
        }

        inner.state = TransactionState::Active;
        info!(
            "[ShardedTransaction] {} began on {} shards",
            self.id,
            inner.transactions.len()
        );
        Ok(())
    }

    /// Commits every shard transaction.
    ///
    /// Synchronizations run first; if one fails nothing is committed and the
    /// transaction stays active. A shard commit failure moves the transaction
    /// to `CommitFailed` after all shards were attempted.
    pub fn commit(&self) -> Result<(), TransactionError> {
        self.require_active("commit")?;
        let failed_enlistment = self.inner.lock().failed_enlistment.clone();
        if let Some((shard, message)) = failed_enlistment {
            warn!(
                "[ShardedTransaction] {} refuses to commit: shard {} never began",
                self.id, shard
            );
            return Err(phase_error(
                TransactionPhase::Begin,
                shard,
                TransactionError::Failed(message),
            ));
        }

        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in &synchronizations {
            synchronization.before_completion().map_err(|err| {
                error!(
                    "[ShardedTransaction] {} before-completion hook failed: {}",
                    self.id, err
                );
                TransactionError::Synchronization(err.to_string())
            })?;
        }

        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Active {
            return Err(TransactionError::InvalidState(format!(
                "transaction {} is {}; cannot commit",
                self.id, inner.state
            )));
        }

        let mut first_failure = None;
        for enlisted in &inner.transactions {
            if let Err(err) = enlisted.transaction.commit() {
                error!(
                    "[ShardedTransaction] {} failed to commit on shard {}: {}",
                    self.id, enlisted.shard, err
                );
                first_failure.get_or_insert((enlisted.shard, err));
            }
        }

        if let Some((shard, err)) = first_failure {
            inner.state = TransactionState::CommitFailed;
            return Err(phase_error(TransactionPhase::Commit, shard, err));
        }

        inner.state = TransactionState::Committed;
        drop(inner);
        info!("[ShardedTransaction] {} committed", self.id);
        for synchronization in &synchronizations {
            synchronization.after_completion(true);
        }
        Ok(())
    }

    /// Rolls back every shard transaction that has not committed.
    ///
    /// Allowed while active or after a failed commit. If any shard fails to
    /// roll back the state is left unchanged so rollback can be retried.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        let mut inner = self.inner.lock();
        match inner.state {
            TransactionState::Active | TransactionState::CommitFailed => {}
            state => {
                return Err(TransactionError::InvalidState(format!(
                    "transaction {} is {}; cannot roll back",
                    self.id, state
                )));
            }
        }

        let mut first_failure = None;
        for enlisted in &inner.transactions {
            let transaction = &enlisted.transaction;
            if transaction.was_committed() || transaction.was_rolled_back() {
                continue;
            }
            if let Err(err) = transaction.rollback() {
                error!(
                    "[ShardedTransaction] {} failed to roll back shard {}: {}",
                    self.id, enlisted.shard, err
                );
                first_failure.get_or_insert((enlisted.shard, err));
            }
        }

        if let Some((shard, err)) = first_failure {
            return Err(phase_error(TransactionPhase::Rollback, shard, err));
        }

        inner.state = TransactionState::RolledBack;
        drop(inner);
        info!("[ShardedTransaction] {} rolled back", self.id);
        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in &synchronizations {
            synchronization.after_completion(false);
        }
        Ok(())
    }

    /// Attaches a collaborator command to the local transaction of the shard
    /// owning `shard_id`.
    pub fn enlist(&self, shard_id: ShardId, command: &mut dyn Any) -> Result<(), TransactionError> {
        self.require_active("enlist")?;
        let shard = self
            .shards
            .iter()
            .find(|shard| shard.owns(shard_id))
            .ok_or_else(|| {
                TransactionError::InvalidState(format!(
                    "shard {} is not part of transaction {}",
                    shard_id, self.id
                ))
            })?;

        let primary = shard.primary_id();
        let transaction = {
            let inner = self.inner.lock();
            inner
                .transactions
                .iter()
                .find(|enlisted| enlisted.shard == primary)
                .map(|enlisted| Arc::clone(&enlisted.transaction))
        };
        let transaction = transaction.ok_or_else(|| {
            TransactionError::InvalidState(format!(
                "shard {} has no established session in transaction {}",
                shard_id, self.id
            ))
        })?;
        transaction.enlist(command)
    }

    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn TransactionSynchronization>,
    ) -> Result<(), TransactionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(TransactionError::InvalidState(format!(
                "transaction {} is already {}",
                self.id, state
            )));
        }
        self.synchronizations.lock().push(synchronization);
        Ok(())
    }

    fn require_active(&self, action: &str) -> Result<(), TransactionError> {
        let state = self.state();
        if state != TransactionState::Active {
            return Err(TransactionError::InvalidState(format!(
                "transaction {} is {}; cannot {}",
                self.id, state, action
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ShardedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedTransaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("shards", &self.shards.len())
            .finish()
    }
}
