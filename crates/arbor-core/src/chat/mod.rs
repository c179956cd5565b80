//! Caller-facing operations over a [`ChatStore`].
//!
//! Every operation takes the caller's [`UserId`] and refuses conversations
//! the caller does not own. Reads go through the registry (active-branch
//! healing) and the assignment index (legacy fallback), then through the
//! tree reconstructor, so they never fail on the shape of stored data.

pub mod fallback;
mod workflow;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{
    CompletionProvider, NoRetrieval, ProviderError, RetrievalError, RetrievalService,
    RetrievedChunk, UnavailableProvider,
};
use crate::assignments::{assign_checked, count_for_branch, messages_for_branch};
use crate::config::ArborConfig;
use crate::domain::{
    Branch, BranchId, BranchSummary, Conversation, ConversationDocument, ConversationId, Message,
    MessageId, Role, Turn, UserId, numbered_branch_name,
};
use crate::error::{Error, Result};
use crate::registry::{BranchSet, load_branches};
use crate::store::{BranchDeletion, ChatStore, NewBranch};
use crate::tree::{self, ConversationTree, ReconstructOptions, Reconstruction};

pub use workflow::{EditOutcome, RegenerateOutcome, SendOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub completion_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub max_results: usize,
    pub reconstruct: ReconstructOptions,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(&ArborConfig::default())
    }
}

impl From<&ArborConfig> for ChatSettings {
    fn from(config: &ArborConfig) -> Self {
        Self {
            completion_timeout: config.completion_timeout(),
            retrieval_timeout: config.retrieval_timeout(),
            max_results: config.retrieval.max_results,
            reconstruct: config.reconstruct_options(),
        }
    }
}

/// Branches of a conversation together with the active branch's messages.
#[derive(Debug, Clone, Serialize)]
pub struct BranchListing {
    pub branches: Vec<BranchSummary>,
    pub active_branch_id: BranchId,
    pub messages: Reconstruction,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchView {
    pub branch: Branch,
    pub messages: Reconstruction,
}

pub struct ChatService {
    store: Arc<dyn ChatStore>,
    provider: Arc<dyn CompletionProvider>,
    retrieval: Arc<dyn RetrievalService>,
    settings: ChatSettings,
}

impl ChatService {
    /// Service with no model and no retrieval; replies are the fallbacks.
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self {
            store,
            provider: Arc::new(UnavailableProvider),
            retrieval: Arc::new(NoRetrieval),
            settings: ChatSettings::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalService>) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    // Conversations

    pub async fn create_conversation(
        &self,
        caller: &UserId,
        title: Option<String>,
    ) -> Result<Conversation> {
        let conversation = Conversation::new(caller.clone(), title);
        let main = Branch::main(conversation.id);
        self.store.create_conversation(&conversation, &main).await?;

        info!(
            target: "arbor::chat",
            conversation_id = %conversation.id,
            branch_id = %main.id,
            "Created conversation"
        );
        Ok(conversation)
    }

    pub async fn list_conversations(&self, caller: &UserId) -> Result<Vec<Conversation>> {
        Ok(self.store.list_conversations(caller).await?)
    }

    pub async fn delete_conversation(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<()> {
        self.owned_conversation(caller, conversation_id).await?;
        self.store.delete_conversation(conversation_id).await?;
        info!(target: "arbor::chat", %conversation_id, "Deleted conversation");
        Ok(())
    }

    pub async fn get_conversation(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation> {
        self.owned_conversation(caller, conversation_id).await
    }

    // Branches

    pub async fn list_branches(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<BranchListing> {
        self.owned_conversation(caller, conversation_id).await?;
        let set = load_branches(self.store.as_ref(), conversation_id).await?;
        let default_id = default_branch_id(&set)?;

        let mut branches = Vec::with_capacity(set.len());
        for branch in set.branches() {
            let message_count = count_for_branch(self.store.as_ref(), branch, default_id).await?;
            branches.push(BranchSummary {
                branch: branch.clone(),
                message_count,
            });
        }

        let active = set
            .active()
            .ok_or_else(|| Error::not_found(format!("active branch of {conversation_id}")))?;
        let messages = self.reconstructed(active, default_id).await?;

        Ok(BranchListing {
            branches,
            active_branch_id: set.active_id(),
            messages,
        })
    }

    pub async fn create_branch(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        parent_branch_id: Option<BranchId>,
        name: Option<String>,
    ) -> Result<Branch> {
        self.owned_conversation(caller, conversation_id).await?;
        let set = load_branches(self.store.as_ref(), conversation_id).await?;

        if let Some(parent) = parent_branch_id {
            if set.get(parent).is_none() {
                return Err(Error::not_found(format!("branch {parent}")));
            }
        }

        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| numbered_branch_name(set.len()));

        let mut branch = Branch::new(conversation_id, name, parent_branch_id);
        branch.is_active = true;
        self.store
            .insert_branch(&NewBranch {
                branch: branch.clone(),
                assign: Vec::new(),
            })
            .await?;

        info!(
            target: "arbor::chat",
            %conversation_id,
            branch_id = %branch.id,
            name = %branch.name,
            "Created branch"
        );
        Ok(branch)
    }

    pub async fn switch_branch(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchView> {
        self.owned_conversation(caller, conversation_id).await?;
        self.store
            .activate_branch(conversation_id, branch_id)
            .await?;
        debug!(target: "arbor::chat", %conversation_id, %branch_id, "Switched branch");

        self.branch_view(conversation_id, branch_id).await
    }

    pub async fn delete_branch(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchDeletion> {
        self.owned_conversation(caller, conversation_id).await?;
        let deletion = self
            .store
            .delete_branch(conversation_id, branch_id)
            .await?;

        info!(
            target: "arbor::chat",
            %conversation_id,
            %branch_id,
            removed_assignments = deletion.removed_assignments,
            removed_messages = deletion.removed_messages,
            activated = ?deletion.activated,
            "Deleted branch"
        );
        Ok(deletion)
    }

    /// Messages of any branch, without switching to it.
    pub async fn branch_messages(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchView> {
        self.owned_conversation(caller, conversation_id).await?;
        self.branch_view(conversation_id, branch_id).await
    }

    // Messages and assignments

    pub async fn save_message_to_branch(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        branch_id: BranchId,
        role: Role,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message> {
        self.owned_conversation(caller, conversation_id).await?;
        require_content(content)?;

        let branch = self
            .store
            .get_branch(branch_id)
            .await?
            .filter(|b| b.conversation_id == conversation_id)
            .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))?;

        if let Some(parent_id) = parent_message_id {
            let parent = self
                .store
                .get_message(parent_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("message {parent_id}")))?;
            if parent.conversation_id != conversation_id {
                return Err(Error::invalid(format!(
                    "parent message {parent_id} belongs to another conversation"
                )));
            }
        }

        self.pin_fallback_views(conversation_id).await?;
        let message = Message::new(conversation_id, role, content, parent_message_id);
        self.store.insert_message(&message).await?;
        self.store
            .assign(conversation_id, message.id, branch.id)
            .await?;

        debug!(
            target: "arbor::chat",
            %conversation_id,
            branch_id = %branch.id,
            message_id = %message.id,
            "Saved message to branch"
        );
        Ok(message)
    }

    pub async fn assign_message(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        message_id: MessageId,
        branch_id: BranchId,
    ) -> Result<bool> {
        self.owned_conversation(caller, conversation_id).await?;
        self.pin_fallback_views(conversation_id).await?;
        assign_checked(self.store.as_ref(), conversation_id, message_id, branch_id).await
    }

    // Views

    pub async fn conversation_tree(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationTree> {
        self.owned_conversation(caller, conversation_id).await?;
        let messages = self.store.messages_by_conversation(conversation_id).await?;
        Ok(tree::build_tree_with(&messages, self.settings.reconstruct))
    }

    pub async fn lineage(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        leaf_id: MessageId,
    ) -> Result<Vec<Message>> {
        self.owned_conversation(caller, conversation_id).await?;
        let messages = self.store.messages_by_conversation(conversation_id).await?;
        if !messages.iter().any(|m| m.id == leaf_id) {
            return Err(Error::not_found(format!("message {leaf_id}")));
        }
        Ok(tree::lineage(&messages, leaf_id))
    }

    pub async fn conversation_documents(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<ConversationDocument>> {
        self.owned_conversation(caller, conversation_id).await?;
        Ok(self.store.conversation_documents(conversation_id).await?)
    }

    // Helpers

    async fn owned_conversation(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("conversation {conversation_id}")))?;

        if !conversation.is_owned_by(caller) {
            warn!(
                target: "arbor::chat",
                %conversation_id,
                caller = %caller,
                "Caller does not own conversation"
            );
            return Err(Error::Forbidden(format!(
                "conversation {conversation_id} belongs to another user"
            )));
        }
        Ok(conversation)
    }

    /// Must run before the first assignment of a conversation that has none:
    /// every branch keeps exactly the messages the fallback showed it.
    async fn pin_fallback_views(&self, conversation_id: ConversationId) -> Result<()> {
        let written = self.store.materialize_fallback(conversation_id).await?;
        if written > 0 {
            info!(
                target: "arbor::chat",
                %conversation_id,
                written,
                "Pinned unassigned messages to every branch"
            );
        }
        Ok(())
    }

    async fn branch_view(
        &self,
        conversation_id: ConversationId,
        branch_id: BranchId,
    ) -> Result<BranchView> {
        let set = load_branches(self.store.as_ref(), conversation_id).await?;
        let default_id = default_branch_id(&set)?;
        let branch = set
            .get(branch_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("branch {branch_id}")))?;
        let messages = self.reconstructed(&branch, default_id).await?;
        Ok(BranchView { branch, messages })
    }

    async fn reconstructed(&self, branch: &Branch, default_id: BranchId) -> Result<Reconstruction> {
        let messages = messages_for_branch(self.store.as_ref(), branch, default_id).await?;
        Ok(tree::reconstruct_with(&messages, self.settings.reconstruct))
    }

    /// Calls the provider under the configured timeout. Returns the reply and
    /// whether the fallback was used.
    async fn complete(&self, turns: &[Turn], fallback: String) -> (String, bool) {
        let timeout = self.settings.completion_timeout;
        let outcome = match tokio::time::timeout(timeout, self.provider.generate(turns)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => Ok(reply),
            Ok(Ok(_)) => Err(ProviderError::EmptyReply),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
        };

        match outcome {
            Ok(reply) => (reply, false),
            Err(e) => {
                warn!(
                    target: "arbor::chat",
                    provider = self.provider.name(),
                    error = %e,
                    "Completion failed, using fallback reply"
                );
                (fallback, true)
            }
        }
    }

    async fn retrieve(&self, query: &str) -> Vec<RetrievedChunk> {
        let timeout = self.settings.retrieval_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            self.retrieval.search(query, self.settings.max_results),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout(timeout.as_secs())),
        };

        match outcome {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(
                    target: "arbor::chat",
                    error = %e,
                    "Retrieval failed, continuing without context"
                );
                Vec::new()
            }
        }
    }
}

fn default_branch_id(set: &BranchSet) -> Result<BranchId> {
    set.default_branch()
        .map(|b| b.id)
        .ok_or_else(|| Error::not_found("default branch"))
}

fn require_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(Error::invalid("message content must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChatStore;

    fn service() -> ChatService {
        ChatService::new(Arc::new(InMemoryChatStore::new()))
    }

    #[tokio::test]
    async fn other_users_are_forbidden() {
        let service = service();
        let owner = UserId::new("owner");
        let conversation = service.create_conversation(&owner, None).await.unwrap();

        let err = service
            .list_branches(&UserId::new("intruder"), conversation.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn new_conversation_has_active_main() {
        let service = service();
        let user = UserId::new("u1");
        let conversation = service
            .create_conversation(&user, Some("  ".to_string()))
            .await
            .unwrap();
        assert_eq!(conversation.title, "New Chat");

        let listing = service.list_branches(&user, conversation.id).await.unwrap();
        assert_eq!(listing.branches.len(), 1);
        assert_eq!(listing.branches[0].branch.name, "Main");
        assert_eq!(listing.active_branch_id, listing.branches[0].branch.id);
        assert!(listing.messages.messages.is_empty());
    }

    #[tokio::test]
    async fn create_branch_names_and_activates() {
        let service = service();
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();

        let branch = service
            .create_branch(&user, conversation.id, None, None)
            .await
            .unwrap();
        assert_eq!(branch.name, "Branch 2");

        let listing = service.list_branches(&user, conversation.id).await.unwrap();
        assert_eq!(listing.active_branch_id, branch.id);

        let err = service
            .create_branch(&user, conversation.id, Some(BranchId::new()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let service = service();
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();
        let listing = service.list_branches(&user, conversation.id).await.unwrap();

        let err = service
            .save_message_to_branch(
                &user,
                conversation.id,
                listing.active_branch_id,
                Role::User,
                "   ",
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn lineage_requires_message_in_conversation() {
        let service = service();
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();

        let err = service
            .lineage(&user, conversation.id, MessageId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
