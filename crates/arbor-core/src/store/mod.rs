//! Persistence for conversations, messages, branches and assignments.
//!
//! [`ChatStore`] exposes primitive operations only. Policy (legacy
//! fallbacks, active-branch healing, edit orchestration) lives in the
//! registry, assignment and chat modules so both backends share it.

mod memory;
mod schema;
mod sqlite;

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::{
    Branch, BranchId, Conversation, ConversationDocument, ConversationId, Message, MessageId,
    UserId,
};

pub use memory::InMemoryChatStore;
pub use schema::{SchemaCapabilities, SchemaGeneration};
pub use sqlite::SqliteChatStore;

use crate::tree::Forest;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("Branch not found: {branch_id}")]
    BranchNotFound { branch_id: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Refusing to delete the last branch of conversation {conversation_id}")]
    LastBranch { conversation_id: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl StoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }

    pub fn conversation_not_found(id: ConversationId) -> Self {
        Self::ConversationNotFound {
            conversation_id: id.to_string(),
        }
    }

    pub fn branch_not_found(id: BranchId) -> Self {
        Self::BranchNotFound {
            branch_id: id.to_string(),
        }
    }

    pub fn message_not_found(id: MessageId) -> Self {
        Self::MessageNotFound {
            message_id: id.to_string(),
        }
    }
}

/// A new branch together with the messages it starts out with.
#[derive(Debug, Clone)]
pub struct NewBranch {
    pub branch: Branch,
    pub assign: Vec<MessageId>,
}

/// Everything an edit or regeneration writes before calling the provider.
///
/// Applied atomically: the snapshot branch (if any), the fork branch, the new
/// message, all assignments, and the switch of the active flag to the fork.
#[derive(Debug, Clone)]
pub struct ForkWrite {
    pub snapshot: Option<NewBranch>,
    pub fork: NewBranch,
    /// Created first, then assigned to the fork branch.
    pub message: Option<Message>,
}

/// What happened when a branch was deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDeletion {
    pub removed_assignments: u64,
    /// Messages only the deleted branch held.
    pub removed_messages: u64,
    /// Set when the deleted branch was active and another one took over.
    pub activated: Option<BranchId>,
}

/// Messages a branch delete leaves behind with nothing referring to them.
///
/// `released` are the messages the deleted branch held, `still_assigned`
/// every message that keeps an assignment afterwards. A released message
/// survives when it is still assigned or is a resolved ancestor of any
/// surviving message, so no remaining view loses its prefix.
pub(crate) fn orphaned_messages(
    messages: &[Message],
    released: &HashSet<MessageId>,
    still_assigned: &HashSet<MessageId>,
) -> Vec<MessageId> {
    let forest = Forest::resolve(messages);
    let candidate: Vec<bool> = forest
        .nodes
        .iter()
        .map(|m| released.contains(&m.id) && !still_assigned.contains(&m.id))
        .collect();

    let mut kept = vec![false; forest.nodes.len()];
    for node in (0..forest.nodes.len()).filter(|&n| !candidate[n]) {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if kept[current] {
                break;
            }
            kept[current] = true;
            cursor = forest.parent[current];
        }
    }

    forest
        .nodes
        .iter()
        .enumerate()
        .filter(|(node, _)| candidate[*node] && !kept[*node])
        .map(|(_, m)| m.id)
        .collect()
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    // Conversations

    /// Inserts the conversation and its first branch together.
    async fn create_conversation(
        &self,
        conversation: &Conversation,
        main_branch: &Branch,
    ) -> Result<(), StoreError>;

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>, StoreError>;

    /// Removes the conversation and everything below it.
    async fn delete_conversation(&self, conversation_id: ConversationId)
    -> Result<bool, StoreError>;

    // Messages

    /// Persists a message and touches the conversation's `updated_at`.
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>, StoreError>;

    /// All messages of a conversation in creation order.
    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError>;

    // Branches

    /// Inserts a branch with its initial assignments. When the branch is
    /// active every other branch of the conversation is deactivated in the
    /// same unit of work.
    async fn insert_branch(&self, new_branch: &NewBranch) -> Result<(), StoreError>;

    async fn get_branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError>;

    /// Branches of a conversation in creation order.
    async fn list_branches(&self, conversation_id: ConversationId)
    -> Result<Vec<Branch>, StoreError>;

    /// Deactivates every branch of the conversation, then activates one.
    async fn activate_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<(), StoreError>;

    /// Deletes a branch and its assignments, refusing to remove the last
    /// branch of the conversation. Messages left without any reference
    /// go with it, in the same unit of work.
    async fn delete_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchDeletion, StoreError>;

    async fn commit_fork(&self, fork: &ForkWrite) -> Result<(), StoreError>;

    // Assignments

    /// Returns false when the pair already existed.
    async fn assign(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        branch_id: BranchId,
    ) -> Result<bool, StoreError>;

    /// Messages assigned to the branch in creation order.
    async fn assigned_messages(&self, branch_id: BranchId) -> Result<Vec<Message>, StoreError>;

    /// Messages of the conversation without any assignment, in creation order.
    async fn unassigned_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError>;

    async fn count_assignments(&self, conversation_id: ConversationId) -> Result<u64, StoreError>;

    /// For a conversation without a single assignment row, assigns every
    /// message to every branch so each branch keeps exactly what the
    /// unassigned fallback showed. A no-op once any assignment exists.
    /// Returns the number of rows written.
    async fn materialize_fallback(&self, conversation_id: ConversationId)
    -> Result<u64, StoreError>;

    // Documents

    /// Idempotently links retrieval documents to the conversation.
    async fn link_documents(
        &self,
        conversation_id: ConversationId,
        documents: &[String],
    ) -> Result<(), StoreError>;

    async fn conversation_documents(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationDocument>, StoreError>;
}
