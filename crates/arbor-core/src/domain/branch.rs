use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{BranchId, ConversationId, MessageId};

pub const MAIN_BRANCH_NAME: &str = "Main";
pub const ORIGINAL_BRANCH_NAME: &str = "Original";

/// A named lineage of messages inside a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub conversation_id: ConversationId,
    pub name: String,
    pub parent_branch_id: Option<BranchId>,
    /// Message whose edit or regeneration produced this branch.
    pub fork_message_id: Option<MessageId>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        conversation_id: ConversationId,
        name: impl Into<String>,
        parent_branch_id: Option<BranchId>,
    ) -> Self {
        Self {
            id: BranchId::new(),
            conversation_id,
            name: name.into(),
            parent_branch_id,
            fork_message_id: None,
            is_active: false,
            created_at: Utc::now(),
        }
    }

    pub fn main(conversation_id: ConversationId) -> Self {
        let mut branch = Self::new(conversation_id, MAIN_BRANCH_NAME, None);
        branch.is_active = true;
        branch
    }

    pub fn forked_at(mut self, message_id: MessageId) -> Self {
        self.fork_message_id = Some(message_id);
        self
    }

    pub fn is_original_snapshot_of(&self, message_id: MessageId) -> bool {
        self.name == ORIGINAL_BRANCH_NAME && self.fork_message_id == Some(message_id)
    }
}

/// Membership of a message in a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBranchAssignment {
    pub message_id: MessageId,
    pub branch_id: BranchId,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageBranchAssignment {
    pub fn new(conversation_id: ConversationId, message_id: MessageId, branch_id: BranchId) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            branch_id,
            conversation_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub branch: Branch,
    pub message_count: usize,
}

/// Default name for a branch that was not given one.
pub fn numbered_branch_name(existing_branches: usize) -> String {
    format!("Branch {}", existing_branches + 1)
}
