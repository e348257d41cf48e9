use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of characters kept in a turn record's content.
pub const TURN_CONTENT_LIMIT: usize = 500;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// What kind of content a turn carried. Streamed audio is not logged as turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Text,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Image => write!(f, "image"),
            ContentKind::Text => write!(f, "text"),
        }
    }
}

/// One entry of a session's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub kind: ContentKind,
    /// At most [`TURN_CONTENT_LIMIT`] characters; longer content is cut.
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, kind: ContentKind, content: &str) -> Self {
        Self {
            role,
            kind,
            content: truncate(content, TURN_CONTENT_LIMIT),
            timestamp: Utc::now(),
        }
    }
}

/// Returns the first `limit` characters of `content`.
pub fn truncate(content: &str, limit: usize) -> String {
    match content.char_indices().nth(limit) {
        Some((end, _)) => content[..end].to_string(),
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_content_is_truncated_not_rejected() {
        let turn = Turn::new(Role::User, ContentKind::Text, &"a".repeat(1200));
        assert_eq!(turn.content.chars().count(), TURN_CONTENT_LIMIT);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
        assert_eq!(truncate("", 3), "");
    }

    #[test]
    fn role_and_kind_display_lowercase() {
        assert_eq!(Role::Assistant.to_string(), "assistant");
        assert_eq!(ContentKind::Image.to_string(), "image");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }

    #[test]
    fn only_image_and_text_kinds_exist() {
        assert_eq!(
            serde_json::from_str::<ContentKind>("\"text\"").unwrap(),
            ContentKind::Text
        );
        assert!(serde_json::from_str::<ContentKind>("\"audio\"").is_err());
    }
}
