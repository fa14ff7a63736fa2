//! Runs result-less commands through the result-bearing fan-out path.

use shardfan_core::{PreparedWork, Shard, ShardCommand, ShardOperation, ShardResult};
use shardfan_exit::ExitStrategy;

/// Presents a [`ShardCommand`] as an operation that never yields a result.
pub(crate) struct CommandOperation<C> {
    command: C,
}

impl<C: ShardCommand> CommandOperation<C> {
    pub(crate) fn new(command: C) -> Self {
        CommandOperation { command }
    }
}

impl<C: ShardCommand> ShardOperation<()> for CommandOperation<C> {
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedWork<()>> {
        let command = self.command.prepare(shard)?;
        Ok(Box::new(move || command().map(|()| None)))
    }

    fn operation_name(&self) -> &str {
        self.command.operation_name()
    }
}

/// Exit strategy for commands: nothing to merge, never halts.
#[derive(Debug, Default)]
pub(crate) struct DiscardExitStrategy;

impl ExitStrategy<()> for DiscardExitStrategy {
    type Output = ();

    fn add_result(&self, _result: (), _shard: &Shard) -> bool {
        false
    }

    fn compile_results(&self) -> ShardResult<()> {
        Ok(())
    }
}
