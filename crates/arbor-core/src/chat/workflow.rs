//! Writes that call out to the completion provider: sending a message,
//! editing a user turn into a new branch, and regenerating a reply.
//!
//! The store writes that shape the branch graph happen before the provider
//! is called and are never rolled back because of it. A failing or slow
//! provider only changes the assistant text to a canned fallback.

use serde::Serialize;
use tracing::{debug, info};

use super::{ChatService, default_branch_id, fallback, require_content};
use crate::api::{RetrievedChunk, cited_documents, citations_from};
use crate::assignments::messages_for_branch;
use crate::domain::{
    Branch, BranchId, ConversationId, Message, MessageId, ORIGINAL_BRANCH_NAME, Role, Turn,
    UserId, numbered_branch_name,
};
use crate::error::{Error, Result};
use crate::registry::{BranchSet, load_branches};
use crate::store::{ForkWrite, NewBranch};
use crate::tree;

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub branch_id: BranchId,
    pub user_message: Message,
    pub assistant_message: Message,
    pub documents: Vec<String>,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub branch: Branch,
    pub user_message: Message,
    pub assistant_message: Message,
    pub original_branch_id: BranchId,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegenerateOutcome {
    pub branch: Branch,
    pub assistant_message: Message,
    pub used_fallback: bool,
}

impl ChatService {
    /// Appends a user turn to the active branch and answers it.
    pub async fn send_message(
        &self,
        caller: &UserId,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<SendOutcome> {
        self.owned_conversation(caller, conversation_id).await?;
        require_content(content)?;

        let set = load_branches(self.store.as_ref(), conversation_id).await?;
        self.pin_fallback_views(conversation_id).await?;
        let default_id = default_branch_id(&set)?;
        let active = set
            .active()
            .cloned()
            .ok_or_else(|| Error::not_found(format!("active branch of {conversation_id}")))?;

        let mut visible = self.reconstructed(&active, default_id).await?.messages;
        let parent = visible.last().map(|m| m.id);

        let user_message = Message::new(conversation_id, Role::User, content, parent);
        self.store.insert_message(&user_message).await?;
        self.store
            .assign(conversation_id, user_message.id, active.id)
            .await?;

        let chunks = self.retrieve(content).await;

        visible.push(user_message.clone());
        let mut turns = context_turns(&chunks);
        turns.extend(
            tree::lineage(&visible, user_message.id)
                .iter()
                .map(Turn::from),
        );

        let (reply, used_fallback) = self.complete(&turns, fallback::send_reply(content)).await;

        let assistant_message = Message::new(
            conversation_id,
            Role::Assistant,
            reply,
            Some(user_message.id),
        )
        .with_citations(citations_from(&chunks));
        self.store.insert_message(&assistant_message).await?;
        self.store
            .assign(conversation_id, assistant_message.id, active.id)
            .await?;

        let documents = cited_documents(&chunks);
        if !documents.is_empty() {
            self.store
                .link_documents(conversation_id, &documents)
                .await?;
        }

        debug!(
            target: "arbor::chat",
            %conversation_id,
            branch_id = %active.id,
            user_message_id = %user_message.id,
            assistant_message_id = %assistant_message.id,
            used_fallback,
            "Sent message"
        );

        Ok(SendOutcome {
            branch_id: active.id,
            user_message,
            assistant_message,
            documents,
            used_fallback,
        })
    }

    /// Forks a new branch at a user message with edited content.
    ///
    /// The first edit of a message also snapshots its pre-edit lineage into
    /// an inactive "Original" branch. The message itself is never modified.
    pub async fn edit_message(
        &self,
        caller: &UserId,
        message_id: MessageId,
        new_content: &str,
    ) -> Result<EditOutcome> {
        let target = self.editable_message(caller, message_id).await?;
        require_content(new_content)?;
        let conversation_id = target.conversation_id;

        let set = load_branches(self.store.as_ref(), conversation_id).await?;
        self.pin_fallback_views(conversation_id).await?;
        let (source, source_messages) = self.source_branch(&set, message_id).await?;

        let all = self.store.messages_by_conversation(conversation_id).await?;
        let ancestors: Vec<MessageId> = tree::lineage(&all, message_id)
            .iter()
            .map(|m| m.id)
            .filter(|id| *id != message_id)
            .collect();

        let existing_original = set
            .branches()
            .iter()
            .find(|b| b.is_original_snapshot_of(message_id))
            .map(|b| b.id);

        let snapshot = if existing_original.is_some() {
            None
        } else {
            let branch = Branch::new(conversation_id, ORIGINAL_BRANCH_NAME, Some(source.id))
                .forked_at(message_id);
            let mut assign = ancestors.clone();
            let lineage_below = tree::subtree(&source_messages, message_id);
            if lineage_below.is_empty() {
                assign.push(message_id);
            }
            assign.extend(lineage_below.iter().map(|m| m.id));
            Some(NewBranch { branch, assign })
        };

        let original_branch_id = existing_original
            .or_else(|| snapshot.as_ref().map(|s| s.branch.id))
            .ok_or_else(|| Error::not_found(format!("original branch of {message_id}")))?;

        let branch_count = set.len() + usize::from(snapshot.is_some());
        let mut branch = Branch::new(
            conversation_id,
            numbered_branch_name(branch_count),
            Some(source.id),
        )
        .forked_at(message_id);
        branch.is_active = true;

        let user_message = Message::new(
            conversation_id,
            Role::User,
            new_content,
            target.parent_message_id,
        );

        self.store
            .commit_fork(&ForkWrite {
                snapshot,
                fork: NewBranch {
                    branch: branch.clone(),
                    assign: ancestors,
                },
                message: Some(user_message.clone()),
            })
            .await?;

        info!(
            target: "arbor::chat",
            %conversation_id,
            %message_id,
            branch_id = %branch.id,
            source_branch_id = %source.id,
            %original_branch_id,
            "Forked branch from edited message"
        );

        let mut context = all;
        context.push(user_message.clone());
        let turns: Vec<Turn> = tree::lineage(&context, user_message.id)
            .iter()
            .map(Turn::from)
            .collect();
        let (reply, used_fallback) = self
            .complete(&turns, fallback::edit_reply(new_content))
            .await;

        let assistant_message = Message::new(
            conversation_id,
            Role::Assistant,
            reply,
            Some(user_message.id),
        );
        self.store.insert_message(&assistant_message).await?;
        self.store
            .assign(conversation_id, assistant_message.id, branch.id)
            .await?;

        Ok(EditOutcome {
            branch,
            user_message,
            assistant_message,
            original_branch_id,
            used_fallback,
        })
    }

    /// Asks for a different reply to a user message on a new branch.
    pub async fn regenerate(
        &self,
        caller: &UserId,
        message_id: MessageId,
    ) -> Result<RegenerateOutcome> {
        let target = self.editable_message(caller, message_id).await?;
        let conversation_id = target.conversation_id;

        let set = load_branches(self.store.as_ref(), conversation_id).await?;
        self.pin_fallback_views(conversation_id).await?;
        let all = self.store.messages_by_conversation(conversation_id).await?;
        let path = tree::lineage(&all, message_id);

        let mut branch = Branch::new(
            conversation_id,
            fallback::regenerated_branch_name(&target.content),
            Some(set.active_id()),
        )
        .forked_at(message_id);
        branch.is_active = true;

        self.store
            .commit_fork(&ForkWrite {
                snapshot: None,
                fork: NewBranch {
                    branch: branch.clone(),
                    assign: path.iter().map(|m| m.id).collect(),
                },
                message: None,
            })
            .await?;

        info!(
            target: "arbor::chat",
            %conversation_id,
            %message_id,
            branch_id = %branch.id,
            "Created branch for regenerated reply"
        );

        let mut turns: Vec<Turn> = path.iter().map(Turn::from).collect();
        turns.push(Turn {
            role: Role::System,
            content: fallback::REGENERATE_INSTRUCTION.to_string(),
        });
        let (reply, used_fallback) = self
            .complete(&turns, fallback::regenerate_reply(&target.content))
            .await;

        let assistant_message =
            Message::new(conversation_id, Role::Assistant, reply, Some(message_id));
        self.store.insert_message(&assistant_message).await?;
        self.store
            .assign(conversation_id, assistant_message.id, branch.id)
            .await?;

        Ok(RegenerateOutcome {
            branch,
            assistant_message,
            used_fallback,
        })
    }

    /// Checks run in order: the message exists, the caller owns its
    /// conversation, and it is a user turn.
    async fn editable_message(&self, caller: &UserId, message_id: MessageId) -> Result<Message> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message {message_id}")))?;

        self.owned_conversation(caller, message.conversation_id)
            .await?;

        if !message.is_user() {
            return Err(Error::invalid(format!(
                "only user messages can be edited, {message_id} is {}",
                message.role
            )));
        }
        Ok(message)
    }

    /// The branch an edit forks from, with its visible messages: the active
    /// branch if it shows the message, else the newest branch that does,
    /// else the default branch.
    async fn source_branch(
        &self,
        set: &BranchSet,
        message_id: MessageId,
    ) -> Result<(Branch, Vec<Message>)> {
        let default_id = default_branch_id(set)?;
        let store = self.store.as_ref();

        let mut candidates: Vec<&Branch> = set.branches().iter().collect();
        candidates.sort_by_key(|b| std::cmp::Reverse(b.created_at));
        if let Some(active) = set.active() {
            candidates.retain(|b| b.id != active.id);
            candidates.insert(0, active);
        }

        for branch in candidates {
            let messages = messages_for_branch(store, branch, default_id).await?;
            if messages.iter().any(|m| m.id == message_id) {
                return Ok((branch.clone(), messages));
            }
        }

        let default = set
            .default_branch()
            .cloned()
            .ok_or_else(|| Error::not_found("default branch"))?;
        let messages = messages_for_branch(store, &default, default_id).await?;
        Ok((default, messages))
    }
}

/// Retrieved passages as a leading system turn.
fn context_turns(chunks: &[RetrievedChunk]) -> Vec<Turn> {
    if chunks.is_empty() {
        return Vec::new();
    }
    let mut content = String::from("Relevant excerpts from the user's documents:\n");
    for chunk in chunks {
        content.push_str(&format!("\n[{}]\n{}\n", chunk.source_document, chunk.content));
    }
    vec![Turn {
        role: Role::System,
        content,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ScriptedProvider, StaticRetrieval};
    use crate::chat::ChatSettings;
    use crate::store::InMemoryChatStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn send_attaches_citations_and_links_documents() {
        let retrieval = StaticRetrieval::new(vec![RetrievedChunk {
            content: "Borrowing rules".to_string(),
            source_document: "book.pdf".to_string(),
            distance: 0.2,
        }]);
        let provider = Arc::new(ScriptedProvider::replying(["Use references."]));
        let service = ChatService::new(Arc::new(InMemoryChatStore::new()))
            .with_provider(provider.clone())
            .with_retrieval(Arc::new(retrieval));
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();

        let sent = service
            .send_message(&user, conversation.id, "How do I borrow?")
            .await
            .unwrap();

        assert!(!sent.used_fallback);
        assert_eq!(sent.assistant_message.content, "Use references.");
        assert!(sent.assistant_message.citations.is_some());
        assert_eq!(sent.documents, vec!["book.pdf"]);

        let calls = provider.calls();
        assert_eq!(calls[0][0].role, Role::System);
        assert_eq!(calls[0].last().map(|t| t.content.as_str()), Some("How do I borrow?"));

        let documents = service
            .conversation_documents(&user, conversation.id)
            .await
            .unwrap();
        assert_eq!(documents.len(), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out_to_fallback() {
        let provider = ScriptedProvider::replying(["too late"]).with_delay(Duration::from_secs(5));
        let settings = ChatSettings {
            completion_timeout: Duration::from_millis(20),
            ..ChatSettings::default()
        };
        let service = ChatService::new(Arc::new(InMemoryChatStore::new()))
            .with_provider(Arc::new(provider))
            .with_settings(settings);
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();

        let sent = service
            .send_message(&user, conversation.id, "hello")
            .await
            .unwrap();
        assert!(sent.used_fallback);
        assert_eq!(sent.assistant_message.content, fallback::send_reply("hello"));
    }

    #[tokio::test]
    async fn second_edit_reuses_original_snapshot() {
        let service = ChatService::new(Arc::new(InMemoryChatStore::new()));
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();
        let sent = service
            .send_message(&user, conversation.id, "hi")
            .await
            .unwrap();

        let first = service
            .edit_message(&user, sent.user_message.id, "hey")
            .await
            .unwrap();
        let second = service
            .edit_message(&user, sent.user_message.id, "hello")
            .await
            .unwrap();

        assert_eq!(first.original_branch_id, second.original_branch_id);
        assert_eq!(first.branch.name, "Branch 3");
        assert_eq!(second.branch.name, "Branch 4");

        let listing = service.list_branches(&user, conversation.id).await.unwrap();
        let originals = listing
            .branches
            .iter()
            .filter(|s| s.branch.name == ORIGINAL_BRANCH_NAME)
            .count();
        assert_eq!(originals, 1);
        assert_eq!(listing.active_branch_id, second.branch.id);
    }

    #[tokio::test]
    async fn regenerate_forks_with_lineage_and_new_reply() {
        let service = ChatService::new(Arc::new(InMemoryChatStore::new()));
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();
        let sent = service
            .send_message(&user, conversation.id, "Explain lifetimes please")
            .await
            .unwrap();

        let regenerated = service
            .regenerate(&user, sent.user_message.id)
            .await
            .unwrap();

        assert!(regenerated.used_fallback);
        assert_eq!(
            regenerated.branch.name,
            "Regenerated response from \"Explain lifetimes please...\""
        );
        assert_eq!(
            regenerated.assistant_message.parent_message_id,
            Some(sent.user_message.id)
        );

        let view = service
            .branch_messages(&user, conversation.id, regenerated.branch.id)
            .await
            .unwrap();
        let ids: Vec<MessageId> = view.messages.messages.iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![sent.user_message.id, regenerated.assistant_message.id]
        );
        assert!(view.branch.is_active);
    }

    #[tokio::test]
    async fn assistant_messages_cannot_be_regenerated() {
        let service = ChatService::new(Arc::new(InMemoryChatStore::new()));
        let user = UserId::new("u1");
        let conversation = service.create_conversation(&user, None).await.unwrap();
        let sent = service
            .send_message(&user, conversation.id, "hi")
            .await
            .unwrap();

        let err = service
            .regenerate(&user, sent.assistant_message.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
