//! Optimistic command execution.
//!
//! A command is an optimistic patch plus the server request that makes it
//! real. The patch is visible in the store before the request is polled;
//! on success the server's answer replaces it, on failure the touched
//! fields go back to their pre-command values and the error is returned to
//! the caller.
//!
//! Commands on the same entity (by [`EntityKey`]) run one at a time, in issue order. Each
//! entity gets a lane guarded by a FIFO `tokio::sync::Mutex`; the lane is
//! dropped again once nothing is pending or queued on it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use newhire_core::{Entity, EntityKey, Patch};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::error::SyncError;
use crate::store::{CommandToken, EntityStore, Resolution};

/// Observable state of an entity's command lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Idle,
    /// A command's request is in flight.
    Pending,
    /// Commands are waiting but none has started yet.
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The server accepted the command; holds the entity as now stored.
    Confirmed(Option<Entity>),
    /// The entity went away while the command was in flight.
    Discarded,
}

#[derive(Debug)]
struct Lane {
    gate: Arc<tokio::sync::Mutex<()>>,
    pending: bool,
    waiting: usize,
}

pub struct OptimisticExecutor {
    store: Arc<EntityStore>,
    lanes: Mutex<HashMap<EntityKey, Lane>>,
}

impl OptimisticExecutor {
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self {
            store,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn state(&self, key: EntityKey) -> CommandState {
        match self.lanes.lock().get(&key) {
            None => CommandState::Idle,
            Some(lane) if lane.pending => CommandState::Pending,
            Some(_) => CommandState::Queued,
        }
    }

    /// Commands waiting behind the one in flight.
    pub fn queued(&self, key: EntityKey) -> usize {
        self.lanes.lock().get(&key).map_or(0, |lane| lane.waiting)
    }

    /// Run one command against `key`.
    ///
    /// `request` is only invoked once the command reaches the head of the
    /// entity's lane and its patch is applied. If the returned future is
    /// dropped before resolving, the command is rolled back.
    pub async fn execute<F, Fut>(
        &self,
        key: EntityKey,
        patch: Patch,
        request: F,
    ) -> Result<CommandOutcome, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Entity>, SyncError>>,
    {
        let gate = self.enter(key);
        let mut slot = LaneSlot {
            executor: self,
            key,
            turn: None,
            token: None,
        };
        slot.turn = Some(gate.lock_owned().await);
        slot.start();

        let token = self.store.claim(key, &patch).ok_or_else(|| {
            SyncError::rejected(None, format!("{key} already has a command in flight"))
        })?;
        slot.token = Some(token);
        log::debug!("command on {key} applied optimistically: {:?}", patch.field_names());

        let result = request().await;
        slot.token = None;
        match result {
            Ok(response) => match self.store.confirm(key, token, response) {
                Resolution::Confirmed => Ok(CommandOutcome::Confirmed(self.store.get(key))),
                _ => {
                    log::debug!("{key} removed before its command resolved");
                    Ok(CommandOutcome::Discarded)
                }
            },
            Err(err) => {
                if self.store.rollback(key, token) == Resolution::RolledBack {
                    log::warn!("command on {key} failed, rolled back: {err}");
                }
                Err(err)
            }
        }
    }

    fn enter(&self, key: EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock();
        let lane = lanes.entry(key).or_insert_with(|| Lane {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            pending: false,
            waiting: 0,
        });
        lane.waiting += 1;
        lane.gate.clone()
    }

    fn leave(&self, key: EntityKey, started: bool) {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(&key) {
            if started {
                lane.pending = false;
            } else {
                lane.waiting = lane.waiting.saturating_sub(1);
            }
            if !lane.pending && lane.waiting == 0 {
                lanes.remove(&key);
            }
        }
    }
}

/// Tracks one command's place in its lane and releases it on every exit
/// path, including cancellation.
struct LaneSlot<'a> {
    executor: &'a OptimisticExecutor,
    key: EntityKey,
    turn: Option<OwnedMutexGuard<()>>,
    token: Option<CommandToken>,
}

impl LaneSlot<'_> {
    fn start(&mut self) {
        let mut lanes = self.executor.lanes.lock();
        if let Some(lane) = lanes.get_mut(&self.key) {
            lane.waiting = lane.waiting.saturating_sub(1);
            lane.pending = true;
        }
    }
}

impl Drop for LaneSlot<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            log::debug!("command on {} abandoned, rolling back", self.key);
            self.executor.store.rollback(self.key, token);
        }
        self.executor.leave(self.key, self.turn.is_some());
        // Lane bookkeeping is settled; hand the lane to the next command.
        self.turn.take();
    }
}
