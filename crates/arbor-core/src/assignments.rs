//! Which messages belong to which branch.
//!
//! Conversations written before assignments existed have no rows at all; for
//! those every branch sees every message. Once a conversation has any
//! assignment, messages without one belong to its default branch. Writers
//! pin the first view onto every branch before adding the first assignment
//! (see `ChatStore::materialize_fallback`), so no branch loses history.

use std::collections::HashSet;
use tracing::debug;

use crate::domain::{Branch, BranchId, ConversationId, Message, MessageId};
use crate::error::{Error, Result};
use crate::store::ChatStore;

/// Messages visible in `branch`, de-duplicated and in creation order.
pub async fn messages_for_branch<S>(
    store: &S,
    branch: &Branch,
    default_branch_id: BranchId,
) -> Result<Vec<Message>>
where
    S: ChatStore + ?Sized,
{
    let conversation_id = branch.conversation_id;

    if store.count_assignments(conversation_id).await? == 0 {
        debug!(
            target: "arbor::assignments",
            %conversation_id,
            "No assignments recorded, using every message of the conversation"
        );
        return Ok(store.messages_by_conversation(conversation_id).await?);
    }

    let mut messages = store.assigned_messages(branch.id).await?;
    if branch.id == default_branch_id {
        messages.extend(store.unassigned_messages(conversation_id).await?);
    }

    let mut seen = HashSet::with_capacity(messages.len());
    messages.retain(|m| seen.insert(m.id));
    messages.sort_by_key(|m| m.created_at);
    Ok(messages)
}

pub async fn count_for_branch<S>(
    store: &S,
    branch: &Branch,
    default_branch_id: BranchId,
) -> Result<usize>
where
    S: ChatStore + ?Sized,
{
    Ok(messages_for_branch(store, branch, default_branch_id)
        .await?
        .len())
}

/// Assigns a message to a branch after checking both live in the
/// conversation. Returns false when the pair already existed.
pub async fn assign_checked<S>(
    store: &S,
    conversation_id: ConversationId,
    message_id: MessageId,
    branch_id: BranchId,
) -> Result<bool>
where
    S: ChatStore + ?Sized,
{
    let message = store
        .get_message(message_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("message {message_id}")))?;
    let branch = store
        .get_branch(branch_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))?;

    if message.conversation_id != conversation_id || branch.conversation_id != conversation_id {
        return Err(Error::invalid(format!(
            "message {message_id} and branch {branch_id} must both belong to conversation {conversation_id}"
        )));
    }

    let inserted = store.assign(conversation_id, message_id, branch_id).await?;
    debug!(
        target: "arbor::assignments",
        %message_id,
        %branch_id,
        inserted,
        "Assigned message to branch"
    );
    Ok(inserted)
}
