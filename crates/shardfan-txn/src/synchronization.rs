use shardfan_core::TransactionError;

/// Callbacks around the completion of a sharded transaction.
pub trait TransactionSynchronization: Send + Sync {
    /// Runs before any shard commits. An error aborts the commit and leaves
    /// the transaction active.
    fn before_completion(&self) -> Result<(), TransactionError>;

    /// Runs once the transaction reached a terminal state.
    fn after_completion(&self, committed: bool);
}
