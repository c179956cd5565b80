//! Chat turns.
//!
//! A [`Message`] is written once and never changed. Edits and regenerations
//! produce new messages that point at an existing parent, which is what turns
//! a conversation into a tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::ids::{ConversationId, MessageId};

/// Role in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub parent_message_id: Option<MessageId>,
    /// Retrieval citations attached to an assistant reply. Opaque to the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
        parent_message_id: Option<MessageId>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            role,
            content: content.into(),
            parent_message_id,
            citations: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_citations(mut self, citations: Option<serde_json::Value>) -> Self {
        self.citations = citations;
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// Role/content pair handed to the completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for Turn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_from_storage_strings() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::System.to_string(), "system");
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn citations_are_skipped_when_absent() {
        let message = Message::new(ConversationId::new(), Role::User, "hi", None);
        let json = serde_json::to_value(&message).unwrap();
        assert!(json.get("citations").is_none());
        assert_eq!(json["role"], "user");
    }
}
