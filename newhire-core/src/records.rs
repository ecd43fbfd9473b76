//! Typed views over the entities the engine stores.
//!
//! Field names match the JSON bodies the backend returns, so a record
//! converts losslessly to and from an [`Entity`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Entity, EntityId, FieldValue, Patch};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("entity {id} is missing field `{field}`")]
    MissingField { id: EntityId, field: &'static str },
    #[error("entity {id} has an unexpected value in `{field}`")]
    WrongType { id: EntityId, field: &'static str },
    #[error("unknown {kind} `{value}`")]
    UnknownVariant { kind: &'static str, value: String },
}

fn text_field(entity: &Entity, field: &'static str) -> Result<String, RecordError> {
    match entity.get(field) {
        Some(FieldValue::Text(s)) => Ok(s.clone()),
        Some(_) => Err(RecordError::WrongType { id: entity.id, field }),
        None => Err(RecordError::MissingField { id: entity.id, field }),
    }
}

fn optional_text(entity: &Entity, field: &'static str) -> Result<Option<String>, RecordError> {
    match entity.get(field) {
        None | Some(FieldValue::Null) => Ok(None),
        Some(FieldValue::Text(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RecordError::WrongType { id: entity.id, field }),
    }
}

fn int_field(entity: &Entity, field: &'static str) -> Result<i64, RecordError> {
    match entity.get(field) {
        Some(FieldValue::Int(i)) => Ok(*i),
        Some(_) => Err(RecordError::WrongType { id: entity.id, field }),
        None => Err(RecordError::MissingField { id: entity.id, field }),
    }
}

fn int_or(entity: &Entity, field: &'static str, default: i64) -> Result<i64, RecordError> {
    match entity.get(field) {
        None | Some(FieldValue::Null) => Ok(default),
        Some(FieldValue::Int(i)) => Ok(*i),
        Some(_) => Err(RecordError::WrongType { id: entity.id, field }),
    }
}

// ───────────────────────────────────────────────────────────────────
// Tickets
// ───────────────────────────────────────────────────────────────────

/// Board column, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketStatus {
    Backlog,
    Todo,
    InProgress,
    CodeReview,
    InTest,
    PoReview,
    Done,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 7] = [
        TicketStatus::Backlog,
        TicketStatus::Todo,
        TicketStatus::InProgress,
        TicketStatus::CodeReview,
        TicketStatus::InTest,
        TicketStatus::PoReview,
        TicketStatus::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Backlog => "BACKLOG",
            TicketStatus::Todo => "TODO",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::CodeReview => "CODE_REVIEW",
            TicketStatus::InTest => "IN_TEST",
            TicketStatus::PoReview => "PO_REVIEW",
            TicketStatus::Done => "DONE",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RecordError::UnknownVariant {
                kind: "ticket status",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "LOW",
            TicketPriority::Medium => "MEDIUM",
            TicketPriority::High => "HIGH",
            TicketPriority::Critical => "CRITICAL",
        }
    }
}

impl FromStr for TicketPriority {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(TicketPriority::Low),
            "MEDIUM" => Ok(TicketPriority::Medium),
            "HIGH" => Ok(TicketPriority::High),
            "CRITICAL" => Ok(TicketPriority::Critical),
            other => Err(RecordError::UnknownVariant {
                kind: "ticket priority",
                value: other.to_string(),
            }),
        }
    }
}

/// One card on the sprint board.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub id: EntityId,
    /// Card headline.
    pub title: String,
    /// Free text, empty when the backend sends none.
    pub description: String,
    /// Board column.
    pub status: TicketStatus,
    /// Defaults to `MEDIUM` when absent.
    pub priority: TicketPriority,
    /// Estimate in points (default: 1).
    pub story_points: i64,
    /// User the ticket is assigned to, if any.
    pub assignee_id: Option<i64>,
    /// ISO-8601 date as sent by the backend.
    pub due_date: Option<String>,
}

impl Ticket {
    /// The optimistic patch for a drag between columns.
    pub fn status_patch(status: TicketStatus) -> Patch {
        Patch::new().set("status", status.as_str())
    }

    pub fn to_entity(&self) -> Entity {
        Entity::new(self.id.0)
            .with("title", self.title.as_str())
            .with("description", self.description.as_str())
            .with("status", self.status.as_str())
            .with("priority", self.priority.as_str())
            .with("story_points", self.story_points)
            .with("assignee_id", self.assignee_id)
            .with("due_date", self.due_date.clone())
    }
}

impl TryFrom<&Entity> for Ticket {
    type Error = RecordError;

    fn try_from(entity: &Entity) -> Result<Self, Self::Error> {
        let assignee_id = match entity.get("assignee_id") {
            None | Some(FieldValue::Null) => None,
            Some(FieldValue::Int(i)) => Some(*i),
            Some(_) => {
                return Err(RecordError::WrongType {
                    id: entity.id,
                    field: "assignee_id",
                })
            }
        };
        Ok(Ticket {
            id: entity.id,
            title: text_field(entity, "title")?,
            description: optional_text(entity, "description")?.unwrap_or_default(),
            status: text_field(entity, "status")?.parse()?,
            priority: optional_text(entity, "priority")?
                .as_deref()
                .unwrap_or("MEDIUM")
                .parse()?,
            story_points: int_or(entity, "story_points", 1)?,
            assignee_id,
            due_date: optional_text(entity, "due_date")?,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Chat
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: EntityId,
    pub channel: String,
    pub content: String,
    pub sender_name: Option<String>,
    pub sender_avatar: Option<String>,
    pub is_bot: bool,
    pub timestamp: String,
}

impl ChatMessage {
    pub fn to_entity(&self) -> Entity {
        Entity::new(self.id.0)
            .with("channel", self.channel.as_str())
            .with("content", self.content.as_str())
            .with("sender_name", self.sender_name.clone())
            .with("sender_avatar", self.sender_avatar.clone())
            .with("is_bot", self.is_bot)
            .with("timestamp", self.timestamp.as_str())
    }
}

impl TryFrom<&Entity> for ChatMessage {
    type Error = RecordError;

    fn try_from(entity: &Entity) -> Result<Self, Self::Error> {
        Ok(ChatMessage {
            id: entity.id,
            channel: text_field(entity, "channel")?,
            content: text_field(entity, "content")?,
            sender_name: optional_text(entity, "sender_name")?,
            sender_avatar: optional_text(entity, "sender_avatar")?,
            is_bot: entity.get("is_bot").and_then(FieldValue::as_bool).unwrap_or(false),
            timestamp: text_field(entity, "timestamp")?,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Activity
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    TicketAssigned,
    TicketCompleted,
    MessageSent,
    MessageReceived,
    RepoCreated,
    StandupCompleted,
    RetrospectiveCompleted,
    CodeReviewSubmitted,
    AchievementEarned,
    TicketStatusChanged,
    PullRequestOpened,
}

impl ActivityKind {
    pub const ALL: [ActivityKind; 11] = [
        ActivityKind::TicketAssigned,
        ActivityKind::TicketCompleted,
        ActivityKind::MessageSent,
        ActivityKind::MessageReceived,
        ActivityKind::RepoCreated,
        ActivityKind::StandupCompleted,
        ActivityKind::RetrospectiveCompleted,
        ActivityKind::CodeReviewSubmitted,
        ActivityKind::AchievementEarned,
        ActivityKind::TicketStatusChanged,
        ActivityKind::PullRequestOpened,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::TicketAssigned => "TICKET_ASSIGNED",
            ActivityKind::TicketCompleted => "TICKET_COMPLETED",
            ActivityKind::MessageSent => "MESSAGE_SENT",
            ActivityKind::MessageReceived => "MESSAGE_RECEIVED",
            ActivityKind::RepoCreated => "REPO_CREATED",
            ActivityKind::StandupCompleted => "STANDUP_COMPLETED",
            ActivityKind::RetrospectiveCompleted => "RETROSPECTIVE_COMPLETED",
            ActivityKind::CodeReviewSubmitted => "CODE_REVIEW_SUBMITTED",
            ActivityKind::AchievementEarned => "ACHIEVEMENT_EARNED",
            ActivityKind::TicketStatusChanged => "TICKET_STATUS_CHANGED",
            ActivityKind::PullRequestOpened => "PULL_REQUEST_OPENED",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| RecordError::UnknownVariant {
                kind: "activity type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub id: EntityId,
    pub kind: ActivityKind,
    pub description: String,
    pub extra_data: FieldValue,
    pub created_at: String,
}

impl ActivityRecord {
    pub fn to_entity(&self) -> Entity {
        Entity::new(self.id.0)
            .with("type", self.kind.as_str())
            .with("description", self.description.as_str())
            .with("extra_data", self.extra_data.clone())
            .with("created_at", self.created_at.as_str())
    }
}

impl TryFrom<&Entity> for ActivityRecord {
    type Error = RecordError;

    fn try_from(entity: &Entity) -> Result<Self, Self::Error> {
        Ok(ActivityRecord {
            id: entity.id,
            kind: text_field(entity, "type")?.parse()?,
            description: text_field(entity, "description")?,
            extra_data: entity.get("extra_data").cloned().unwrap_or(FieldValue::Null),
            created_at: text_field(entity, "created_at")?,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Metrics panel
// ───────────────────────────────────────────────────────────────────

/// Scores live in 0..=100; the backend clamps them before emitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub user_id: EntityId,
    /// Starts at 1.
    pub level: i64,
    /// Experience points; the only required field.
    pub xp: i64,
    pub truthfulness: i64,
    pub effort: i64,
    pub reliability: i64,
    pub collaboration: i64,
    pub quality: i64,
}

impl StatsSnapshot {
    pub fn to_entity(&self) -> Entity {
        Entity::new(self.user_id.0)
            .with("level", self.level)
            .with("xp", self.xp)
            .with("truthfulness", self.truthfulness)
            .with("effort", self.effort)
            .with("reliability", self.reliability)
            .with("collaboration", self.collaboration)
            .with("quality", self.quality)
    }

    /// Metric rows in panel order.
    pub fn metrics(&self) -> [(&'static str, i64); 5] {
        [
            ("Truthfulness", self.truthfulness),
            ("Effort", self.effort),
            ("Reliability", self.reliability),
            ("Collaboration", self.collaboration),
            ("Quality", self.quality),
        ]
    }
}

impl TryFrom<&Entity> for StatsSnapshot {
    type Error = RecordError;

    fn try_from(entity: &Entity) -> Result<Self, Self::Error> {
        Ok(StatsSnapshot {
            user_id: entity.id,
            level: int_or(entity, "level", 1)?,
            xp: int_field(entity, "xp")?,
            truthfulness: int_or(entity, "truthfulness", 50)?,
            effort: int_or(entity, "effort", 50)?,
            reliability: int_or(entity, "reliability", 50)?,
            collaboration: int_or(entity, "collaboration", 50)?,
            quality: int_or(entity, "quality", 50)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ticket() -> Ticket {
        Ticket {
            id: EntityId(3),
            title: "Add login".into(),
            description: "OAuth flow".into(),
            status: TicketStatus::Todo,
            priority: TicketPriority::High,
            story_points: 3,
            assignee_id: Some(42),
            due_date: None,
        }
    }

    #[test]
    fn test_ticket_entity_conversion() {
        let ticket = sample_ticket();
        let entity = ticket.to_entity();
        assert_eq!(entity.text("status"), Some("TODO"));
        assert_eq!(Ticket::try_from(&entity).unwrap(), ticket);
    }

    #[test]
    fn test_ticket_status_patch() {
        let entity = sample_ticket().to_entity();
        let moved = entity.apply(&Ticket::status_patch(TicketStatus::InProgress));
        assert_eq!(Ticket::try_from(&moved).unwrap().status, TicketStatus::InProgress);
    }

    #[test]
    fn test_ticket_defaults_for_sparse_bodies() {
        let entity = Entity::new(1).with("title", "Bare").with("status", "BACKLOG");
        let ticket = Ticket::try_from(&entity).unwrap();
        assert_eq!(ticket.priority, TicketPriority::Medium);
        assert_eq!(ticket.story_points, 1);
        assert_eq!(ticket.description, "");
    }

    #[test]
    fn test_ticket_rejects_unknown_status() {
        let entity = Entity::new(1).with("title", "Bad").with("status", "WONTFIX");
        assert!(matches!(
            Ticket::try_from(&entity),
            Err(RecordError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn test_status_order_matches_board() {
        let names: Vec<&str> = TicketStatus::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names[0], "BACKLOG");
        assert_eq!(names[6], "DONE");
        assert!(TicketStatus::Todo < TicketStatus::InProgress);
    }

    #[test]
    fn test_chat_message_conversion() {
        let msg = ChatMessage {
            id: EntityId(9),
            channel: "general".into(),
            content: "hi".into(),
            sender_name: Some("sarah".into()),
            sender_avatar: None,
            is_bot: true,
            timestamp: "2024-01-01T10:00:00".into(),
        };
        assert_eq!(ChatMessage::try_from(&msg.to_entity()).unwrap(), msg);
    }

    #[test]
    fn test_activity_kind_parse() {
        for kind in ActivityKind::ALL {
            assert_eq!(kind.as_str().parse::<ActivityKind>().unwrap(), kind);
        }
        assert!("NOPE".parse::<ActivityKind>().is_err());
    }

    #[test]
    fn test_stats_missing_xp() {
        let entity = Entity::new(42).with("level", 2i64);
        assert_eq!(
            StatsSnapshot::try_from(&entity),
            Err(RecordError::MissingField { id: EntityId(42), field: "xp" })
        );
    }

    #[test]
    fn test_stats_metrics_order() {
        let stats = StatsSnapshot {
            user_id: EntityId(1),
            level: 2,
            xp: 600,
            truthfulness: 51,
            effort: 52,
            reliability: 53,
            collaboration: 54,
            quality: 55,
        };
        let metrics = stats.metrics();
        assert_eq!(metrics[0], ("Truthfulness", 51));
        assert_eq!(metrics[4], ("Quality", 55));
        assert_eq!(StatsSnapshot::try_from(&stats.to_entity()).unwrap(), stats);
    }
}
