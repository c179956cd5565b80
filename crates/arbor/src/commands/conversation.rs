use async_trait::async_trait;
use chrono::Local;
use comfy_table::Cell;
use eyre::{Result, eyre};
use std::io::Write;
use std::sync::Arc;

use super::{Command, Context, header};
use crate::cli::ConversationCommands;

pub struct ConversationCommand {
    pub ctx: Arc<Context>,
    pub action: ConversationCommands,
}

#[async_trait]
impl Command for ConversationCommand {
    async fn execute(&self) -> Result<()> {
        let service = &self.ctx.service;
        let user = &self.ctx.user;
        let mut stdout = std::io::stdout();

        match &self.action {
            ConversationCommands::New { title } => {
                let conversation = service
                    .create_conversation(user, title.clone())
                    .await
                    .map_err(|e| eyre!("Failed to create conversation: {}", e))?;
                writeln!(stdout, "Created conversation: {}", conversation.id)?;
                writeln!(stdout, "Title: {}", conversation.title)?;
            }
            ConversationCommands::List => {
                let conversations = service
                    .list_conversations(user)
                    .await
                    .map_err(|e| eyre!("Failed to list conversations: {}", e))?;

                if conversations.is_empty() {
                    writeln!(stdout, "No conversations found.")?;
                    return Ok(());
                }

                let mut table = header(&["ID", "Title", "Created", "Updated"]);
                for conversation in conversations {
                    table.add_row(vec![
                        Cell::new(conversation.id),
                        Cell::new(&conversation.title),
                        Cell::new(
                            conversation
                                .created_at
                                .with_timezone(&Local)
                                .format("%Y-%m-%d %H:%M:%S"),
                        ),
                        Cell::new(
                            conversation
                                .updated_at
                                .with_timezone(&Local)
                                .format("%Y-%m-%d %H:%M:%S"),
                        ),
                    ]);
                }
                writeln!(stdout, "{table}")?;
            }
            ConversationCommands::Delete { conversation } => {
                service
                    .delete_conversation(user, *conversation)
                    .await
                    .map_err(|e| eyre!("Failed to delete conversation: {}", e))?;
                writeln!(stdout, "Deleted conversation: {conversation}")?;
            }
        }

        Ok(())
    }
}
