//! The single conflict rule of the engine.
//!
//! A command in flight for entity E owns the fields its optimistic patch
//! touched. Pushes and fetches may not write those fields until the command
//! resolves; every other field, and every field once nothing is in flight,
//! is last-write-wins by arrival order at the client.
//!
//! Both the executor and the windowed stores reach entity state only
//! through [`EntityStore`](crate::store::EntityStore), which asks this
//! module before every write.

use newhire_core::{Entity, FieldSet, Patch};

/// Where an incoming value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Server push event.
    Push,
    /// REST page or collection fetch.
    Fetch,
    /// The executor itself: optimistic patch, server response, rollback.
    Command,
}

/// Result of filtering a partial update against a claim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Admission {
    /// Fields that may be written now.
    pub applied: Patch,
    /// Fields held back because a command owns them.
    pub shadowed: FieldSet,
}

pub struct ReconciliationPolicy;

impl ReconciliationPolicy {
    pub fn admit(source: UpdateSource, incoming: &Patch, owned: Option<&FieldSet>) -> Admission {
        match (source, owned) {
            (UpdateSource::Command, _) | (_, None) => Admission {
                applied: incoming.clone(),
                shadowed: FieldSet::new(),
            },
            (UpdateSource::Push | UpdateSource::Fetch, Some(owned)) => Admission {
                applied: incoming.without(owned),
                shadowed: incoming
                    .field_names()
                    .intersection(owned)
                    .cloned()
                    .collect(),
            },
        }
    }

    /// Merge a full snapshot over the current value.
    ///
    /// Without a claim the incoming snapshot replaces the entity. With one,
    /// the owned fields keep their speculative values and everything else
    /// comes from the snapshot.
    pub fn merge_snapshot(
        source: UpdateSource,
        current: Option<&Entity>,
        incoming: &Entity,
        owned: Option<&FieldSet>,
    ) -> Entity {
        let owned = match (source, owned) {
            (UpdateSource::Command, _) | (_, None) => return incoming.clone(),
            (_, Some(owned)) => owned,
        };
        let mut merged = incoming.clone();
        for field in owned {
            merged.fields.remove(field);
            if let Some(value) = current.and_then(|c| c.get(field)) {
                merged.fields.insert(field.clone(), value.clone());
            }
        }
        merged
    }
}
