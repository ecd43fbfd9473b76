use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub mod records;
pub mod topic;

pub use records::{
    ActivityKind, ActivityRecord, ChatMessage, RecordError, StatsSnapshot, Ticket,
    TicketPriority, TicketStatus,
};
pub use topic::{Topic, TopicKind};

/// Server-assigned, stable identifier of an entity.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id)
    }
}

/// Which server collection an id belongs to. Every collection numbers its
/// records independently, so an id alone does not name an entity.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Ticket,
    Message,
    Activity,
    /// Stats are keyed by the user they belong to.
    Stats,
    Other,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Ticket => "ticket",
            ResourceKind::Message => "message",
            ResourceKind::Activity => "activity",
            ResourceKind::Stats => "stats",
            ResourceKind::Other => "other",
        }
    }

    pub fn key(self, id: u64) -> EntityKey {
        EntityKey::new(self, EntityId(id))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource-qualified identity of an entity.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: ResourceKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: ResourceKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;
pub type FieldSet = BTreeSet<String>;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(Fields),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Converts a JSON value coming from a REST body.
    ///
    /// Integers that fit in `i64` stay integers; every other number
    /// becomes a float.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Array(items) => FieldValue::List(items.iter().map(FieldValue::from_json).collect()),
            Value::Object(map) => FieldValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Map(fields) => Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Partial set of field assignments.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct Patch {
    fields: Fields,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style assignment.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn field_names(&self) -> FieldSet {
        self.fields.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The part of this patch that does not touch `excluded`.
    pub fn without(&self, excluded: &FieldSet) -> Patch {
        Patch {
            fields: self
                .fields
                .iter()
                .filter(|(k, _)| !excluded.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn from_json(value: &Value) -> Result<Patch, EntityError> {
        let map = value.as_object().ok_or(EntityError::NotAnObject)?;
        Ok(Patch {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                .collect(),
        })
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, FieldValue)> for Patch {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Patch {
            fields: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EntityError {
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("missing or non-integer `id`")]
    MissingId,
}

/// Immutable value snapshot of a server-owned record.
///
/// Mutation produces a new snapshot; nothing is edited in place
/// behind another view's back.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub fields: Fields,
}

impl Entity {
    pub fn new(id: u64) -> Self {
        Self {
            id: EntityId(id),
            fields: Fields::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_int)
    }

    /// New snapshot with `patch` merged over the current fields.
    pub fn apply(&self, patch: &Patch) -> Entity {
        let mut next = self.clone();
        for (k, v) in patch.iter() {
            next.fields.insert(k.clone(), v.clone());
        }
        next
    }

    /// All fields as a patch.
    pub fn to_patch(&self) -> Patch {
        self.fields.clone().into_iter().collect()
    }

    pub fn from_json(value: &Value) -> Result<Entity, EntityError> {
        let map = value.as_object().ok_or(EntityError::NotAnObject)?;
        let id = map
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(EntityError::MissingId)?;
        let fields = map
            .iter()
            .filter(|(k, _)| k.as_str() != "id")
            .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
            .collect();
        Ok(Entity {
            id: EntityId(id),
            fields,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("id".to_string(), Value::from(self.id.0));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_is_partial_merge() {
        let ticket = Entity::new(7)
            .with("title", "Fix login")
            .with("status", "TODO");
        let next = ticket.apply(&Patch::new().set("status", "IN_PROGRESS"));

        assert_eq!(next.text("status"), Some("IN_PROGRESS"));
        assert_eq!(next.text("title"), Some("Fix login"));
        // Original snapshot untouched
        assert_eq!(ticket.text("status"), Some("TODO"));
    }

    #[test]
    fn test_patch_without_excludes_fields() {
        let patch = Patch::new().set("status", "DONE").set("title", "New");
        let owned: FieldSet = ["status".to_string()].into_iter().collect();
        let rest = patch.without(&owned);
        assert!(!rest.contains("status"));
        assert_eq!(rest.get("title"), Some(&FieldValue::from("New")));
    }

    #[test]
    fn test_entity_from_json() {
        let value = json!({
            "id": 12,
            "channel": "general",
            "is_bot": false,
            "extra_data": {"pr": 4},
            "score": 1.5
        });
        let entity = Entity::from_json(&value).unwrap();
        assert_eq!(entity.id, EntityId(12));
        assert_eq!(entity.text("channel"), Some("general"));
        assert_eq!(entity.get("is_bot"), Some(&FieldValue::Bool(false)));
        assert_eq!(entity.get("score"), Some(&FieldValue::Float(1.5)));
        assert!(entity.get("id").is_none());
        assert_eq!(entity.to_json(), value);
    }

    #[test]
    fn test_entity_from_json_requires_id() {
        assert_eq!(
            Entity::from_json(&json!({"title": "x"})),
            Err(EntityError::MissingId)
        );
        assert_eq!(Entity::from_json(&json!([1, 2])), Err(EntityError::NotAnObject));
    }

    #[test]
    fn test_option_into_field_value() {
        assert_eq!(FieldValue::from(None::<i64>), FieldValue::Null);
        assert_eq!(FieldValue::from(Some(3i64)), FieldValue::Int(3));
    }

    #[test]
    fn test_keys_of_different_kinds_differ() {
        let ticket = ResourceKind::Ticket.key(1);
        let message = ResourceKind::Message.key(1);
        assert_ne!(ticket, message);
        assert_eq!(ticket.id, message.id);
        assert_eq!(ticket.to_string(), "ticket/1");
    }
}
