//! Canonical per-entity state.
//!
//! One record per [`EntityKey`], shared by every view that shows it. Each
//! server collection numbers its records on its own, so ticket 1 and
//! message 1 are different entries. Pushes,
//! fetches and command results all enter through the `ingest_*` methods,
//! which run the [`ReconciliationPolicy`] against any claim the executor
//! holds on the entity.
//!
//! Writes take a short `parking_lot` lock and never await while holding it.
//! Each write bumps a revision published on a `watch` channel so readers
//! can wait for change without polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use newhire_core::{Entity, EntityId, EntityKey, FieldSet, FieldValue, Patch, ResourceKind};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::policy::{ReconciliationPolicy, UpdateSource};

/// Identifies one command's claim on an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandToken(u64);

/// How a command's claim was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Confirmed,
    RolledBack,
    /// The claim no longer exists (entity deleted or store cleared).
    Discarded,
}

#[derive(Debug, Clone)]
struct Claim {
    token: CommandToken,
    owned: FieldSet,
    /// Pre-command value of every owned field; `None` when it was absent.
    prior: BTreeMap<String, Option<FieldValue>>,
    existed: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    entities: HashMap<EntityKey, Entity>,
    claims: HashMap<EntityKey, Claim>,
    next_token: u64,
}

/// Read-only copy of the store at one revision.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub entities: Arc<HashMap<EntityKey, Entity>>,
}

impl StoreSnapshot {
    pub fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(&key)
    }
}

pub struct EntityStore {
    state: RwLock<StoreState>,
    revision: watch::Sender<u64>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: RwLock::new(StoreState::default()),
            revision,
        }
    }

    pub fn get(&self, key: EntityKey) -> Option<Entity> {
        self.state.read().entities.get(&key).cloned()
    }

    /// Resolve ids of one collection in order, skipping any that are not
    /// held.
    pub fn get_many(&self, kind: ResourceKind, ids: &[EntityId]) -> Vec<Entity> {
        let state = self.state.read();
        ids.iter()
            .filter_map(|id| state.entities.get(&EntityKey::new(kind, *id)).cloned())
            .collect()
    }

    pub fn contains(&self, key: EntityKey) -> bool {
        self.state.read().entities.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that observes every revision bump.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        StoreSnapshot {
            revision: self.revision(),
            entities: Arc::new(state.entities.clone()),
        }
    }

    /// Fields currently owned by an in-flight command.
    pub fn claimed_fields(&self, key: EntityKey) -> Option<FieldSet> {
        self.state.read().claims.get(&key).map(|c| c.owned.clone())
    }

    pub fn is_claimed(&self, key: EntityKey) -> bool {
        self.state.read().claims.contains_key(&key)
    }

    /// Merge a full entity snapshot belonging to the `kind` collection.
    pub fn ingest_entity(&self, kind: ResourceKind, entity: Entity, source: UpdateSource) {
        let key = EntityKey::new(kind, entity.id);
        {
            let mut state = self.state.write();
            let owned = state.claims.get(&key).map(|c| &c.owned);
            let merged = ReconciliationPolicy::merge_snapshot(
                source,
                state.entities.get(&key),
                &entity,
                owned,
            );
            state.entities.insert(key, merged);
            self.bump();
        }
    }

    /// Apply a partial update. Creates the entity if it is not held yet.
    ///
    /// Returns the fields that were held back by a claim.
    pub fn ingest_patch(&self, key: EntityKey, patch: &Patch, source: UpdateSource) -> FieldSet {
        let admission = {
            let mut state = self.state.write();
            let owned = state.claims.get(&key).map(|c| &c.owned);
            let admission = ReconciliationPolicy::admit(source, patch, owned);
            if !admission.applied.is_empty() {
                let next = match state.entities.get(&key) {
                    Some(current) => current.apply(&admission.applied),
                    None => Entity {
                        id: key.id,
                        fields: admission
                            .applied
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    },
                };
                state.entities.insert(key, next);
                self.bump();
            }
            admission
        };
        if !admission.shadowed.is_empty() {
            log::debug!(
                "{key}: {:?} held back by in-flight command ({source:?})",
                admission.shadowed
            );
        }
        admission.shadowed
    }

    /// Server-confirmed deletion. Drops any claim, so a late command
    /// resolution for this entity is discarded.
    pub fn remove(&self, key: EntityKey) -> Option<Entity> {
        let mut state = self.state.write();
        if state.claims.remove(&key).is_some() {
            log::debug!("{key} deleted while a command was in flight");
        }
        let removed = state.entities.remove(&key);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Apply an optimistic patch and record which fields it now owns.
    ///
    /// Returns `None` if another command already holds a claim.
    pub fn claim(&self, key: EntityKey, patch: &Patch) -> Option<CommandToken> {
        let token = {
            let mut state = self.state.write();
            if state.claims.contains_key(&key) {
                return None;
            }
            state.next_token += 1;
            let token = CommandToken(state.next_token);

            let current = state.entities.get(&key).cloned();
            let prior = patch
                .field_names()
                .into_iter()
                .map(|name| {
                    let value = current.as_ref().and_then(|e| e.get(&name)).cloned();
                    (name, value)
                })
                .collect();
            let next = current
                .as_ref()
                .map(|e| e.apply(patch))
                .unwrap_or_else(|| Entity::new(key.id.0).apply(patch));

            state.claims.insert(
                key,
                Claim {
                    token,
                    owned: patch.field_names(),
                    prior,
                    existed: current.is_some(),
                },
            );
            state.entities.insert(key, next);
            self.bump();
            token
        };
        Some(token)
    }

    /// Release a claim after the server accepted the command.
    ///
    /// A response entity replaces the local record; without one the
    /// optimistic values simply become authoritative.
    pub fn confirm(&self, key: EntityKey, token: CommandToken, response: Option<Entity>) -> Resolution {
        {
            let mut state = self.state.write();
            match state.claims.get(&key) {
                Some(claim) if claim.token == token => {}
                _ => return Resolution::Discarded,
            }
            state.claims.remove(&key);
            if let Some(mut entity) = response {
                entity.id = key.id;
                state.entities.insert(key, entity);
            }
            self.bump();
        }
        Resolution::Confirmed
    }

    /// Release a claim after the command failed, restoring the owned fields
    /// to their pre-command values. Fields the command did not own keep
    /// whatever pushes wrote meanwhile.
    pub fn rollback(&self, key: EntityKey, token: CommandToken) -> Resolution {
        {
            let mut state = self.state.write();
            let claim = match state.claims.get(&key) {
                Some(claim) if claim.token == token => claim.clone(),
                _ => return Resolution::Discarded,
            };
            state.claims.remove(&key);
            if !claim.existed {
                state.entities.remove(&key);
            } else if let Some(entity) = state.entities.get_mut(&key) {
                for (name, value) in claim.prior {
                    match value {
                        Some(value) => {
                            entity.fields.insert(name, value);
                        }
                        None => {
                            entity.fields.remove(&name);
                        }
                    }
                }
            }
            self.bump();
        }
        Resolution::RolledBack
    }

    /// Drop every entity and claim.
    pub fn clear(&self) {
        {
            let mut state = self.state.write();
            state.entities.clear();
            state.claims.clear();
            self.bump();
        }
    }

    /// Called with the write lock held, so a snapshot's revision always
    /// matches its entities.
    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}
