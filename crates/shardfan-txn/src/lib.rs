//! shardfan-txn: one logical transaction over many shard-local transactions.
//!
//! [`ShardedTransaction`] drives begin, commit and rollback across every
//! shard of a sharded session. Begin is all-or-nothing, commit and rollback
//! always attempt every shard, and shards whose session appears later are
//! enlisted as they are established.

pub mod synchronization;
pub mod transaction;

pub use synchronization::TransactionSynchronization;
pub use transaction::{ShardedTransaction, TransactionSnapshot, TransactionState};

#[cfg(test)]
pub(crate) mod test_support {
    use std::any::Any;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use shardfan_core::{
        IsolationLevel, PhysicalShardId, SessionFactory, Shard, ShardId, ShardResult,
        ShardSession, ShardTransaction, TransactionError,
    };

    #[derive(Default)]
    struct Flags {
        active: bool,
        committed: bool,
        rolled_back: bool,
        isolation: Option<IsolationLevel>,
    }

    /// Shard-local transaction with switchable failures and call counters.
    #[derive(Default)]
    pub(crate) struct MockTransaction {
        flags: Mutex<Flags>,
        begin_fails: AtomicBool,
        commit_fails: AtomicBool,
        rollback_fails: AtomicBool,
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        enlisted: AtomicUsize,
    }

    impl MockTransaction {
        pub(crate) fn fail_begin(&self, fail: bool) {
            self.begin_fails.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_commit(&self, fail: bool) {
            self.commit_fails.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn fail_rollback(&self, fail: bool) {
            self.rollback_fails.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn begins(&self) -> usize {
            self.begins.load(Ordering::SeqCst)
        }

        pub(crate) fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }

        pub(crate) fn rollbacks(&self) -> usize {
            self.rollbacks.load(Ordering::SeqCst)
        }

        pub(crate) fn enlisted(&self) -> usize {
            self.enlisted.load(Ordering::SeqCst)
        }

        pub(crate) fn isolation(&self) -> Option<IsolationLevel> {
            self.flags.lock().isolation
        }
    }

    impl ShardTransaction for MockTransaction {
        fn begin(&self, isolation: IsolationLevel) -> Result<(), TransactionError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            if self.begin_fails.load(Ordering::SeqCst) {
                return Err(TransactionError::Failed("begin refused".into()));
            }
            let mut flags = self.flags.lock();
            flags.active = true;
            flags.rolled_back = false;
            flags.isolation = Some(isolation);
            Ok(())
        }

        fn commit(&self) -> Result<(), TransactionError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.commit_fails.load(Ordering::SeqCst) {
                return Err(TransactionError::Failed("commit refused".into()));
            }
            let mut flags = self.flags.lock();
            flags.active = false;
            flags.committed = true;
            Ok(())
        }

        fn rollback(&self) -> Result<(), TransactionError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.rollback_fails.load(Ordering::SeqCst) {
                return Err(TransactionError::Failed("rollback refused".into()));
            }
            let mut flags = self.flags.lock();
            flags.active = false;
            flags.rolled_back = true;
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.flags.lock().active
        }

        fn was_committed(&self) -> bool {
            self.flags.lock().committed
        }

        fn was_rolled_back(&self) -> bool {
            self.flags.lock().rolled_back
        }

        fn enlist(&self, _command: &mut dyn Any) -> Result<(), TransactionError> {
            self.enlisted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockSession {
        transaction: Arc<MockTransaction>,
    }

    impl ShardSession for MockSession {
        fn transaction(&self) -> Arc<dyn ShardTransaction> {
            self.transaction.clone()
        }

        fn close(&self) -> ShardResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MockFactory {
        transaction: Arc<MockTransaction>,
    }

    impl SessionFactory for MockFactory {
        fn open_session(&self, _ids: &BTreeSet<ShardId>) -> ShardResult<Arc<dyn ShardSession>> {
            Ok(Arc::new(MockSession {
                transaction: Arc::clone(&self.transaction),
            }))
        }
    }

    /// Shards `0..count`, each with one virtual shard and one mock transaction.
    pub(crate) struct MockShards {
        pub(crate) shards: Vec<Arc<Shard>>,
        transactions: Vec<Arc<MockTransaction>>,
    }

    impl MockShards {
        pub(crate) fn new(count: u32) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let transactions: Vec<Arc<MockTransaction>> =
                (0..count).map(|_| Arc::new(MockTransaction::default())).collect();
            let shards = transactions
                .iter()
                .enumerate()
                .map(|(id, transaction)| {
                    let id = id as u32;
                    Arc::new(
                        Shard::new(
                            PhysicalShardId(id),
                            BTreeSet::from([ShardId(id)]),
                            Arc::new(MockFactory {
                                transaction: Arc::clone(transaction),
                            }),
                        )
                        .unwrap(),
                    )
                })
                .collect();
            MockShards {
                shards,
                transactions,
            }
        }

        pub(crate) fn transaction(&self, idx: u32) -> &MockTransaction {
            &self.transactions[idx as usize]
        }
    }
}
