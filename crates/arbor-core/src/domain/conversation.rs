use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, UserId};

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: UserId, title: Option<String>) -> Self {
        let now = Utc::now();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_CONVERSATION_TITLE.to_string());
        Self {
            id: ConversationId::new(),
            user_id,
            title,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }
}

/// A retrieval document referenced by a reply in this conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDocument {
    pub conversation_id: ConversationId,
    pub document: String,
    pub linked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_title_falls_back_to_default() {
        let conversation = Conversation::new(UserId::new("u1"), Some("   ".to_string()));
        assert_eq!(conversation.title, DEFAULT_CONVERSATION_TITLE);
    }

    #[test]
    fn ownership_compares_user_ids() {
        let conversation = Conversation::new(UserId::new("u1"), Some("Rust".to_string()));
        assert!(conversation.is_owned_by(&UserId::new("u1")));
        assert!(!conversation.is_owned_by(&UserId::new("u2")));
    }
}
