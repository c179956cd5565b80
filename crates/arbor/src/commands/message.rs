use arbor_core::domain::{BranchId, ConversationId, MessageId};
use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::sync::Arc;

use super::{Command, Context};

pub struct SendCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
    pub content: String,
}

#[async_trait]
impl Command for SendCommand {
    async fn execute(&self) -> Result<()> {
        let sent = self
            .ctx
            .service
            .send_message(&self.ctx.user, self.conversation, &self.content)
            .await
            .map_err(|e| eyre!("Failed to send message: {}", e))?;

        let mut stdout = std::io::stdout();
        writeln!(stdout, "You ({}): {}", sent.user_message.id, sent.user_message.content)?;
        writeln!(
            stdout,
            "Assistant ({}): {}",
            sent.assistant_message.id, sent.assistant_message.content
        )?;
        if !sent.documents.is_empty() {
            writeln!(stdout, "Sources: {}", sent.documents.join(", "))?;
        }
        Ok(())
    }
}

pub struct EditCommand {
    pub ctx: Arc<Context>,
    pub message: MessageId,
    pub content: String,
}

#[async_trait]
impl Command for EditCommand {
    async fn execute(&self) -> Result<()> {
        let edit = self
            .ctx
            .service
            .edit_message(&self.ctx.user, self.message, &self.content)
            .await
            .map_err(|e| eyre!("Failed to edit message: {}", e))?;

        let mut stdout = std::io::stdout();
        writeln!(stdout, "Created branch {} ({})", edit.branch.name, edit.branch.id)?;
        writeln!(stdout, "Original kept on branch: {}", edit.original_branch_id)?;
        writeln!(stdout, "You ({}): {}", edit.user_message.id, edit.user_message.content)?;
        writeln!(
            stdout,
            "Assistant ({}): {}",
            edit.assistant_message.id, edit.assistant_message.content
        )?;
        Ok(())
    }
}

pub struct RegenerateCommand {
    pub ctx: Arc<Context>,
    pub message: MessageId,
}

#[async_trait]
impl Command for RegenerateCommand {
    async fn execute(&self) -> Result<()> {
        let outcome = self
            .ctx
            .service
            .regenerate(&self.ctx.user, self.message)
            .await
            .map_err(|e| eyre!("Failed to regenerate reply: {}", e))?;

        let mut stdout = std::io::stdout();
        writeln!(
            stdout,
            "Created branch {} ({})",
            outcome.branch.name, outcome.branch.id
        )?;
        writeln!(
            stdout,
            "Assistant ({}): {}",
            outcome.assistant_message.id, outcome.assistant_message.content
        )?;
        Ok(())
    }
}

pub struct AssignCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
    pub message: MessageId,
    pub branch: BranchId,
}

#[async_trait]
impl Command for AssignCommand {
    async fn execute(&self) -> Result<()> {
        let inserted = self
            .ctx
            .service
            .assign_message(&self.ctx.user, self.conversation, self.message, self.branch)
            .await
            .map_err(|e| eyre!("Failed to assign message: {}", e))?;

        let mut stdout = std::io::stdout();
        if inserted {
            writeln!(stdout, "Assigned {} to {}", self.message, self.branch)?;
        } else {
            writeln!(stdout, "{} was already on {}", self.message, self.branch)?;
        }
        Ok(())
    }
}
