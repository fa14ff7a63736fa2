//! Units of work that can be fanned out across shards.
//!
//! An operation is prepared once per shard. Preparation may touch builder
//! state shared between shards and therefore takes `&mut self`; access
//! strategies serialize it behind a lock. The prepared work owns everything it
//! needs and may run on any worker thread.

use std::marker::PhantomData;

use futures::future::BoxFuture;

use crate::error::ShardResult;
use crate::shard::Shard;

/// Work prepared for one shard. `Ok(None)` means the shard had no result.
pub type PreparedWork<R> = Box<dyn FnOnce() -> ShardResult<Option<R>> + Send>;

/// Asynchronous work prepared for one shard.
pub type PreparedAsyncWork<R> = BoxFuture<'static, ShardResult<Option<R>>>;

/// Prepared command with no result.
pub type PreparedCommand = Box<dyn FnOnce() -> ShardResult<()> + Send>;

/// Result-bearing operation (list, unique result, execute update, ...).
pub trait ShardOperation<R>: Send {
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedWork<R>>;

    /// Name used in logs and error messages only.
    fn operation_name(&self) -> &str;
}

pub trait AsyncShardOperation<R>: Send {
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedAsyncWork<R>>;

    fn operation_name(&self) -> &str;
}

/// Operation run for its side effects only.
pub trait ShardCommand: Send {
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedCommand>;

    fn operation_name(&self) -> &str;
}

/// Operation built from a preparation closure.
pub struct FnOperation<F, R> {
    name: String,
    prepare: F,
    _result: PhantomData<fn() -> R>,
}

/// Creates a [`ShardOperation`] from a closure that prepares work for a shard.
pub fn operation_fn<F, R>(name: impl Into<String>, prepare: F) -> FnOperation<F, R>
where
    F: FnMut(&Shard) -> ShardResult<PreparedWork<R>> + Send,
{
    FnOperation {
        name: name.into(),
        prepare,
        _result: PhantomData,
    }
}

impl<F, R> ShardOperation<R> for FnOperation<F, R>
where
    F: FnMut(&Shard) -> ShardResult<PreparedWork<R>> + Send,
{
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedWork<R>> {
        (self.prepare)(shard)
    }

    fn operation_name(&self) -> &str {
        &self.name
    }
}

pub struct AsyncFnOperation<F, R> {
    name: String,
    prepare: F,
    _result: PhantomData<fn() -> R>,
}

pub fn async_operation_fn<F, R>(name: impl Into<String>, prepare: F) -> AsyncFnOperation<F, R>
where
    F: FnMut(&Shard) -> ShardResult<PreparedAsyncWork<R>> + Send,
{
    AsyncFnOperation {
        name: name.into(),
        prepare,
        _result: PhantomData,
    }
}

impl<F, R> AsyncShardOperation<R> for AsyncFnOperation<F, R>
where
    F: FnMut(&Shard) -> ShardResult<PreparedAsyncWork<R>> + Send,
{
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedAsyncWork<R>> {
        (self.prepare)(shard)
    }

    fn operation_name(&self) -> &str {
        &self.name
    }
}

pub struct FnCommand<F> {
    name: String,
    prepare: F,
}

pub fn command_fn<F>(name: impl Into<String>, prepare: F) -> FnCommand<F>
where
    F: FnMut(&Shard) -> ShardResult<PreparedCommand> + Send,
{
    FnCommand {
        name: name.into(),
        prepare,
    }
}

impl<F> ShardCommand for FnCommand<F>
where
    F: FnMut(&Shard) -> ShardResult<PreparedCommand> + Send,
{
    fn prepare(&mut self, shard: &Shard) -> ShardResult<PreparedCommand> {
        (self.prepare)(shard)
    }

    fn operation_name(&self) -> &str {
        &self.name
    }
}
