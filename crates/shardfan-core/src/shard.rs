// Shard handle with a lazily established session
//
// INVARIANTS:
// 1. At most one session is established per shard handle at a time
// 2. establish_session is idempotent: later calls return the cached session
// 3. Every deferred callback fires exactly once, in registration order,
//    when the session is established (or immediately if it already is)
// 4. A shard handle always owns at least one virtual ShardId
// 5. Callbacks bound to a dropped owner are discarded, never run

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};

use log::{debug, error, info};
use parking_lot::Mutex;

use crate::error::{ShardError, ShardResult};
use crate::session::{SessionFactory, ShardSession};
use crate::shard_id::{PhysicalShardId, ShardId};

/// Callback deferred until the shard's session exists.
///
/// Callbacks run while the shard's internal lock is held and must not call
/// back into the same shard.
pub type OnEstablish = Box<dyn FnOnce(&Arc<dyn ShardSession>) -> ShardResult<()> + Send>;

struct PendingCallback {
    callback: OnEstablish,
    /// Reports whether the callback's owner still exists.
    alive: Option<Box<dyn Fn() -> bool + Send>>,
}

impl PendingCallback {
    fn is_alive(&self) -> bool {
        self.alive.as_ref().map_or(true, |alive| alive())
    }
}

struct ShardState {
    session: Option<Arc<dyn ShardSession>>,
    pending: Vec<PendingCallback>,
}

/// One physical shard as seen by a logical session.
pub struct Shard {
    physical_id: PhysicalShardId,
    shard_ids: BTreeSet<ShardId>,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<ShardState>,
}

impl Shard {
    pub fn new(
        physical_id: PhysicalShardId,
        shard_ids: BTreeSet<ShardId>,
        factory: Arc<dyn SessionFactory>,
    ) -> ShardResult<Self> {
        if shard_ids.is_empty() {
            return Err(ShardError::Config(format!(
                "{} must own at least one virtual shard",
                physical_id
            )));
        }
        Ok(Shard {
            physical_id,
            shard_ids,
            factory,
            state: Mutex::new(ShardState {
                session: None,
                pending: Vec::new(),
            }),
        })
    }

    pub fn physical_id(&self) -> PhysicalShardId {
        self.physical_id
    }

    pub fn shard_ids(&self) -> &BTreeSet<ShardId> {
        &self.shard_ids
    }

    /// Lowest virtual shard id; used to label logs and errors.
    pub fn primary_id(&self) -> ShardId {
        // non-empty by construction
        self.shard_ids.iter().next().copied().unwrap_or_default()
    }

    pub fn owns(&self, shard_id: ShardId) -> bool {
        self.shard_ids.contains(&shard_id)
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// The current session, without establishing one.
    pub fn session(&self) -> Option<Arc<dyn ShardSession>> {
        self.state.lock().session.clone()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Returns the shard's session, opening it on first use.
    ///
    /// Deferred callbacks are flushed exactly once when the session is
    /// opened. If one fails the session stays established, the remaining
    /// callbacks still run, and the first failure is returned.
    pub fn establish_session(&self) -> ShardResult<Arc<dyn ShardSession>> {
        let mut state = self.state.lock();
        if let Some(session) = &state.session {
            return Ok(Arc::clone(session));
        }

        let session = self.factory.open_session(&self.shard_ids)?;
        state.session = Some(Arc::clone(&session));
        info!(
            "[Shard] Established session on {} for shards {:?}",
            self.physical_id, self.shard_ids
        );

        let pending = std::mem::take(&mut state.pending);
        let mut first_error = None;
        for pending in pending {
            if let Err(err) = (pending.callback)(&session) {
                error!(
                    "[Shard] Establish callback failed on {}: {}",
                    self.physical_id, err
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(session),
        }
    }

    /// Registers a callback to run once the session exists.
    ///
    /// If the session is already established the callback runs immediately.
    pub fn on_establish(&self, callback: OnEstablish) -> ShardResult<()> {
        self.register(PendingCallback {
            callback,
            alive: None,
        })
    }

    /// Like [`on_establish`](Self::on_establish), but bound to `owner`
    /// through a weak reference.
    ///
    /// Once the owner is dropped the callback is never run, and it is
    /// removed from the pending list the next time a callback is registered.
    pub fn on_establish_weak<T, F>(&self, owner: &Arc<T>, callback: F) -> ShardResult<()>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, &Arc<dyn ShardSession>) -> ShardResult<()> + Send + 'static,
    {
        let liveness: Weak<T> = Arc::downgrade(owner);
        let weak: Weak<T> = Arc::downgrade(owner);
        self.register(PendingCallback {
            callback: Box::new(move |session: &Arc<dyn ShardSession>| match weak.upgrade() {
                Some(owner) => callback(owner, session),
                None => Ok(()),
            }),
            alive: Some(Box::new(move || liveness.strong_count() > 0)),
        })
    }

    fn register(&self, pending: PendingCallback) -> ShardResult<()> {
        let established = {
            let mut state = self.state.lock();
            match &state.session {
                Some(session) => Arc::clone(session),
                None => {
                    let before = state.pending.len();
                    state.pending.retain(PendingCallback::is_alive);
                    if state.pending.len() < before {
                        debug!(
                            "[Shard] Dropped {} orphaned callbacks on {}",
                            before - state.pending.len(),
                            self.physical_id
                        );
                    }
                    state.pending.push(pending);
                    debug!(
                        "[Shard] Deferred callback on {} ({} pending)",
                        self.physical_id,
                        state.pending.len()
                    );
                    return Ok(());
                }
            }
        };
        (pending.callback)(&established)
    }

    /// Closes and forgets the established session.
    ///
    /// Returns `false` if no session was established.
    pub fn close_session(&self) -> ShardResult<bool> {
        let session = self.state.lock().session.take();
        match session {
            Some(session) => {
                session.close()?;
                info!("[Shard] Closed session on {}", self.physical_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("physical_id", &self.physical_id)
            .field("shard_ids", &self.shard_ids)
            .field("established", &self.is_established())
            .finish()
    }
}
