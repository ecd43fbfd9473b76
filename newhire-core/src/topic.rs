//! Subscription keys for the push feed.
//!
//! ```text
//! channel:<name>        chat channel messages
//! user:<id>:activity    activity feed of one user
//! user:<id>:stats       metrics panel of one user
//! board:tickets         sprint board tickets
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ResourceKind;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

/// Parsed shape of a topic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind<'a> {
    Channel(&'a str),
    UserActivity(u64),
    UserStats(u64),
    Board,
    Other,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn channel(name: &str) -> Self {
        Topic(format!("channel:{name}"))
    }

    pub fn user_activity(user_id: u64) -> Self {
        Topic(format!("user:{user_id}:activity"))
    }

    pub fn user_stats(user_id: u64) -> Self {
        Topic(format!("user:{user_id}:stats"))
    }

    pub fn board() -> Self {
        Topic("board:tickets".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TopicKind<'_> {
        if self.0 == "board:tickets" {
            return TopicKind::Board;
        }
        if let Some(name) = self.0.strip_prefix("channel:") {
            if !name.is_empty() {
                return TopicKind::Channel(name);
            }
            return TopicKind::Other;
        }
        if let Some(rest) = self.0.strip_prefix("user:") {
            if let Some((id, suffix)) = rest.split_once(':') {
                if let Ok(id) = id.parse::<u64>() {
                    match suffix {
                        "activity" => return TopicKind::UserActivity(id),
                        "stats" => return TopicKind::UserStats(id),
                        _ => {}
                    }
                }
            }
        }
        TopicKind::Other
    }

    /// Collection whose records this topic carries.
    pub fn resource_kind(&self) -> ResourceKind {
        match self.kind() {
            TopicKind::Channel(_) => ResourceKind::Message,
            TopicKind::UserActivity(_) => ResourceKind::Activity,
            TopicKind::UserStats(_) => ResourceKind::Stats,
            TopicKind::Board => ResourceKind::Ticket,
            TopicKind::Other => ResourceKind::Other,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::channel("general").as_str(), "channel:general");
        assert_eq!(Topic::user_activity(42).as_str(), "user:42:activity");
        assert_eq!(Topic::user_stats(42).as_str(), "user:42:stats");
    }

    #[test]
    fn test_topic_kind_roundtrip() {
        assert_eq!(Topic::channel("code-review").kind(), TopicKind::Channel("code-review"));
        assert_eq!(Topic::user_activity(7).kind(), TopicKind::UserActivity(7));
        assert_eq!(Topic::user_stats(9).kind(), TopicKind::UserStats(9));
        assert_eq!(Topic::board().kind(), TopicKind::Board);
    }

    #[test]
    fn test_resource_kind_per_topic() {
        assert_eq!(Topic::channel("general").resource_kind(), ResourceKind::Message);
        assert_eq!(Topic::user_activity(1).resource_kind(), ResourceKind::Activity);
        assert_eq!(Topic::user_stats(1).resource_kind(), ResourceKind::Stats);
        assert_eq!(Topic::board().resource_kind(), ResourceKind::Ticket);
        assert_eq!(Topic::new("misc").resource_kind(), ResourceKind::Other);
    }

    #[test]
    fn test_unknown_topics() {
        assert_eq!(Topic::new("user:x:stats").kind(), TopicKind::Other);
        assert_eq!(Topic::new("user:1:badges").kind(), TopicKind::Other);
        assert_eq!(Topic::new("channel:").kind(), TopicKind::Other);
        assert_eq!(Topic::new("anything").kind(), TopicKind::Other);
    }
}
