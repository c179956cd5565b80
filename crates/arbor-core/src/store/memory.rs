use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::RwLock;

use super::{BranchDeletion, ChatStore, ForkWrite, NewBranch, StoreError, orphaned_messages};
use crate::domain::{
    Branch, BranchId, Conversation, ConversationDocument, ConversationId, Message,
    MessageBranchAssignment, MessageId, UserId,
};

/// Store backed by plain vectors, for tests and ephemeral sessions.
///
/// Everything sits behind one lock so multi-row writes are atomic the same
/// way a SQLite transaction is.
pub struct InMemoryChatStore {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    branches: Vec<Branch>,
    assignments: Vec<MessageBranchAssignment>,
    documents: Vec<ConversationDocument>,
}

impl State {
    fn conversation_mut(
        &mut self,
        conversation_id: ConversationId,
    ) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| StoreError::conversation_not_found(conversation_id))
    }

    fn has_conversation(&self, conversation_id: ConversationId) -> bool {
        self.conversations.iter().any(|c| c.id == conversation_id)
    }

    fn push_message(&mut self, message: &Message) -> Result<(), StoreError> {
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::database(format!(
                "message {} already exists",
                message.id
            )));
        }
        self.conversation_mut(message.conversation_id)?.updated_at = Utc::now();
        self.messages.push(message.clone());
        Ok(())
    }

    fn assign(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        branch_id: BranchId,
    ) -> bool {
        if self
            .assignments
            .iter()
            .any(|a| a.message_id == message_id && a.branch_id == branch_id)
        {
            return false;
        }
        self.assignments.push(MessageBranchAssignment::new(
            conversation_id,
            message_id,
            branch_id,
        ));
        true
    }

    fn push_branch(&mut self, new_branch: &NewBranch) -> Result<(), StoreError> {
        let branch = &new_branch.branch;
        if !self.has_conversation(branch.conversation_id) {
            return Err(StoreError::conversation_not_found(branch.conversation_id));
        }
        if branch.is_active {
            for other in self
                .branches
                .iter_mut()
                .filter(|b| b.conversation_id == branch.conversation_id)
            {
                other.is_active = false;
            }
        }
        self.branches.push(branch.clone());
        for message_id in &new_branch.assign {
            self.assign(branch.conversation_id, *message_id, branch.id);
        }
        Ok(())
    }
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::lock_poisoned("state"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::lock_poisoned("state"))
    }

    /// Writes a message without any assignment, the way rows from the flat
    /// schema generation look.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn insert_raw_message(&self, message: Message) -> Result<(), StoreError> {
        self.write()?.messages.push(message);
        Ok(())
    }

    /// Flips the active flag of a single branch without touching the others.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn force_active_flag(&self, branch_id: BranchId, active: bool) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let branch = state
            .branches
            .iter_mut()
            .find(|b| b.id == branch_id)
            .ok_or_else(|| StoreError::branch_not_found(branch_id))?;
        branch.is_active = active;
        Ok(())
    }
}

impl Default for InMemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_conversation(
        &self,
        conversation: &Conversation,
        main_branch: &Branch,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.has_conversation(conversation.id) {
            return Err(StoreError::database(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        state.conversations.push(conversation.clone());
        state.push_branch(&NewBranch {
            branch: main_branch.clone(),
            assign: Vec::new(),
        })
    }

    async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        Ok(self
            .read()?
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned())
    }

    async fn list_conversations(&self, user_id: &UserId) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self
            .read()?
            .conversations
            .iter()
            .filter(|c| &c.user_id == user_id)
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if !state.has_conversation(conversation_id) {
            return Ok(false);
        }
        state.conversations.retain(|c| c.id != conversation_id);
        state.messages.retain(|m| m.conversation_id != conversation_id);
        state.branches.retain(|b| b.conversation_id != conversation_id);
        state
            .assignments
            .retain(|a| a.conversation_id != conversation_id);
        state
            .documents
            .retain(|d| d.conversation_id != conversation_id);
        Ok(true)
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.write()?.push_message(message)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self
            .read()?
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn messages_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read()?
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn insert_branch(&self, new_branch: &NewBranch) -> Result<(), StoreError> {
        self.write()?.push_branch(new_branch)
    }

    async fn get_branch(&self, branch_id: BranchId) -> Result<Option<Branch>, StoreError> {
        Ok(self
            .read()?
            .branches
            .iter()
            .find(|b| b.id == branch_id)
            .cloned())
    }

    async fn list_branches(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Branch>, StoreError> {
        Ok(self
            .read()?
            .branches
            .iter()
            .filter(|b| b.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn activate_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state
            .branches
            .iter()
            .any(|b| b.id == branch_id && b.conversation_id == conversation_id)
        {
            return Err(StoreError::branch_not_found(branch_id));
        }
        for branch in state
            .branches
            .iter_mut()
            .filter(|b| b.conversation_id == conversation_id)
        {
            branch.is_active = branch.id == branch_id;
        }
        Ok(())
    }

    async fn delete_branch(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchDeletion, StoreError> {
        let mut state = self.write()?;
        let Some(position) = state
            .branches
            .iter()
            .position(|b| b.id == branch_id && b.conversation_id == conversation_id)
        else {
            return Err(StoreError::branch_not_found(branch_id));
        };
        let siblings = state
            .branches
            .iter()
            .filter(|b| b.conversation_id == conversation_id)
            .count();
        if siblings <= 1 {
            return Err(StoreError::LastBranch {
                conversation_id: conversation_id.to_string(),
            });
        }

        let removed = state.branches.remove(position);
        let released: HashSet<MessageId> = state
            .assignments
            .iter()
            .filter(|a| a.branch_id == branch_id)
            .map(|a| a.message_id)
            .collect();
        let before = state.assignments.len();
        state.assignments.retain(|a| a.branch_id != branch_id);
        let removed_assignments = (before - state.assignments.len()) as u64;

        let still_assigned: HashSet<MessageId> = state
            .assignments
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .map(|a| a.message_id)
            .collect();
        let conversation_messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        let orphans: HashSet<MessageId> =
            orphaned_messages(&conversation_messages, &released, &still_assigned)
                .into_iter()
                .collect();
        state.messages.retain(|m| !orphans.contains(&m.id));
        let removed_messages = orphans.len() as u64;

        let mut activated = None;
        if removed.is_active {
            if let Some(next) = state
                .branches
                .iter_mut()
                .filter(|b| b.conversation_id == conversation_id)
                .max_by_key(|b| b.created_at)
            {
                next.is_active = true;
                activated = Some(next.id);
            }
        }

        Ok(BranchDeletion {
            removed_assignments,
            removed_messages,
            activated,
        })
    }

    async fn commit_fork(&self, fork: &ForkWrite) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let conversation_id = fork.fork.branch.conversation_id;
        if !state.has_conversation(conversation_id) {
            return Err(StoreError::conversation_not_found(conversation_id));
        }

        // Validate before mutating so a failure leaves nothing behind.
        if let Some(message) = &fork.message {
            if state.messages.iter().any(|m| m.id == message.id) {
                return Err(StoreError::database(format!(
                    "message {} already exists",
                    message.id
                )));
            }
        }

        if let Some(snapshot) = &fork.snapshot {
            state.push_branch(snapshot)?;
        }
        state.push_branch(&fork.fork)?;
        if let Some(message) = &fork.message {
            state.push_message(message)?;
            state.assign(conversation_id, message.id, fork.fork.branch.id);
        }
        Ok(())
    }

    async fn assign(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        branch_id: BranchId,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        if !state.messages.iter().any(|m| m.id == message_id) {
            return Err(StoreError::message_not_found(message_id));
        }
        if !state.branches.iter().any(|b| b.id == branch_id) {
            return Err(StoreError::branch_not_found(branch_id));
        }
        Ok(state.assign(conversation_id, message_id, branch_id))
    }

    async fn assigned_messages(&self, branch_id: BranchId) -> Result<Vec<Message>, StoreError> {
        let state = self.read()?;
        let assigned: HashSet<MessageId> = state
            .assignments
            .iter()
            .filter(|a| a.branch_id == branch_id)
            .map(|a| a.message_id)
            .collect();
        Ok(state
            .messages
            .iter()
            .filter(|m| assigned.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn unassigned_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.read()?;
        let assigned: HashSet<MessageId> = state
            .assignments
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .map(|a| a.message_id)
            .collect();
        Ok(state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && !assigned.contains(&m.id))
            .cloned()
            .collect())
    }

    async fn count_assignments(&self, conversation_id: ConversationId) -> Result<u64, StoreError> {
        Ok(self
            .read()?
            .assignments
            .iter()
            .filter(|a| a.conversation_id == conversation_id)
            .count() as u64)
    }

    async fn materialize_fallback(
        &self,
        conversation_id: ConversationId,
    ) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        if state
            .assignments
            .iter()
            .any(|a| a.conversation_id == conversation_id)
        {
            return Ok(0);
        }

        let messages: Vec<MessageId> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.id)
            .collect();
        let branches: Vec<BranchId> = state
            .branches
            .iter()
            .filter(|b| b.conversation_id == conversation_id)
            .map(|b| b.id)
            .collect();

        let mut written = 0;
        for branch_id in branches {
            for message_id in &messages {
                if state.assign(conversation_id, *message_id, branch_id) {
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn link_documents(
        &self,
        conversation_id: ConversationId,
        documents: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.has_conversation(conversation_id) {
            return Err(StoreError::conversation_not_found(conversation_id));
        }
        for document in documents {
            let known = state
                .documents
                .iter()
                .any(|d| d.conversation_id == conversation_id && &d.document == document);
            if !known {
                state.documents.push(ConversationDocument {
                    conversation_id,
                    document: document.clone(),
                    linked_at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn conversation_documents(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationDocument>, StoreError> {
        Ok(self
            .read()?
            .documents
            .iter()
            .filter(|d| d.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Role;

    async fn seeded() -> (InMemoryChatStore, Conversation, Branch) {
        let store = InMemoryChatStore::new();
        let conversation = Conversation::new(UserId::new("u1"), None);
        let main = Branch::main(conversation.id);
        store.create_conversation(&conversation, &main).await.unwrap();
        (store, conversation, main)
    }

    #[tokio::test]
    async fn assign_is_idempotent() {
        let (store, conversation, main) = seeded().await;
        let message = Message::new(conversation.id, Role::User, "hi", None);
        store.insert_message(&message).await.unwrap();

        assert!(store.assign(conversation.id, message.id, main.id).await.unwrap());
        assert!(!store.assign(conversation.id, message.id, main.id).await.unwrap());
        assert_eq!(store.count_assignments(conversation.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn active_insert_deactivates_siblings() {
        let (store, conversation, main) = seeded().await;
        let mut second = Branch::new(conversation.id, "Branch 2", Some(main.id));
        second.is_active = true;
        store
            .insert_branch(&NewBranch {
                branch: second.clone(),
                assign: Vec::new(),
            })
            .await
            .unwrap();

        let branches = store.list_branches(conversation.id).await.unwrap();
        let active: Vec<_> = branches.iter().filter(|b| b.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
    }

    #[tokio::test]
    async fn last_branch_cannot_be_deleted() {
        let (store, conversation, main) = seeded().await;
        let err = store.delete_branch(conversation.id, main.id).await.unwrap_err();
        assert!(matches!(err, StoreError::LastBranch { .. }));
        assert_eq!(store.list_branches(conversation.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_conversation_cascades() {
        let (store, conversation, main) = seeded().await;
        let message = Message::new(conversation.id, Role::User, "hi", None);
        store.insert_message(&message).await.unwrap();
        store.assign(conversation.id, message.id, main.id).await.unwrap();
        store
            .link_documents(conversation.id, &["guide.pdf".to_string()])
            .await
            .unwrap();

        assert!(store.delete_conversation(conversation.id).await.unwrap());
        assert!(store.get_message(message.id).await.unwrap().is_none());
        assert!(store.list_branches(conversation.id).await.unwrap().is_empty());
        assert_eq!(store.count_assignments(conversation.id).await.unwrap(), 0);
        assert!(
            store
                .conversation_documents(conversation.id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(!store.delete_conversation(conversation.id).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_a_branch_drops_only_its_own_messages() {
        let (store, conversation, main) = seeded().await;
        let root = Message::new(conversation.id, Role::User, "root", None);
        let reply = Message::new(conversation.id, Role::Assistant, "reply", Some(root.id));
        let fork = Message::new(conversation.id, Role::User, "fork", Some(reply.id));
        for message in [&root, &reply, &fork] {
            store.insert_message(message).await.unwrap();
        }
        store.assign(conversation.id, reply.id, main.id).await.unwrap();

        // The side branch also holds the root, which main only reaches as an
        // ancestor of its reply.
        let side = Branch::new(conversation.id, "Branch 2", Some(main.id));
        store
            .insert_branch(&NewBranch {
                branch: side.clone(),
                assign: vec![root.id, fork.id],
            })
            .await
            .unwrap();

        let deletion = store.delete_branch(conversation.id, side.id).await.unwrap();
        assert_eq!(deletion.removed_assignments, 2);
        assert_eq!(deletion.removed_messages, 1);
        assert!(store.get_message(fork.id).await.unwrap().is_none());
        assert!(store.get_message(root.id).await.unwrap().is_some());
        assert!(store.get_message(reply.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn materialize_fallback_copies_every_message_to_every_branch() {
        let (store, conversation, main) = seeded().await;
        let side = Branch::new(conversation.id, "Branch 2", Some(main.id));
        store
            .insert_branch(&NewBranch {
                branch: side.clone(),
                assign: Vec::new(),
            })
            .await
            .unwrap();
        for text in ["a", "b"] {
            store
                .insert_raw_message(Message::new(conversation.id, Role::User, text, None))
                .unwrap();
        }

        assert_eq!(store.materialize_fallback(conversation.id).await.unwrap(), 4);
        assert_eq!(store.assigned_messages(side.id).await.unwrap().len(), 2);
        assert_eq!(store.assigned_messages(main.id).await.unwrap().len(), 2);
        assert_eq!(store.materialize_fallback(conversation.id).await.unwrap(), 0);
    }
}
