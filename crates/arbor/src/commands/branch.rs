use arbor_core::chat::BranchView;
use async_trait::async_trait;
use comfy_table::Cell;
use eyre::{Result, eyre};
use std::io::Write;
use std::sync::Arc;

use super::{Command, Context, header, messages_table};
use crate::cli::BranchCommands;
use arbor_core::domain::ConversationId;

/// Lists branches with their message counts and the active branch's thread.
pub struct BranchesCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
}

#[async_trait]
impl Command for BranchesCommand {
    async fn execute(&self) -> Result<()> {
        let listing = self
            .ctx
            .service
            .list_branches(&self.ctx.user, self.conversation)
            .await
            .map_err(|e| eyre!("Failed to list branches: {}", e))?;

        let mut table = header(&["", "ID", "Name", "Parent", "Messages"]);
        for summary in &listing.branches {
            let branch = &summary.branch;
            table.add_row(vec![
                Cell::new(if branch.id == listing.active_branch_id { "*" } else { "" }),
                Cell::new(branch.id),
                Cell::new(&branch.name),
                Cell::new(
                    branch
                        .parent_branch_id
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(summary.message_count),
            ]);
        }

        let mut stdout = std::io::stdout();
        writeln!(stdout, "{table}")?;
        writeln!(stdout, "Active branch: {}", listing.active_branch_id)?;
        writeln!(stdout, "{}", messages_table(&listing.messages.messages))?;
        if listing.messages.partial {
            writeln!(stdout, "(thread truncated)")?;
        }
        Ok(())
    }
}

pub struct BranchCommand {
    pub ctx: Arc<Context>,
    pub action: BranchCommands,
}

#[async_trait]
impl Command for BranchCommand {
    async fn execute(&self) -> Result<()> {
        let service = &self.ctx.service;
        let user = &self.ctx.user;
        let mut stdout = std::io::stdout();

        match &self.action {
            BranchCommands::Create {
                conversation,
                parent,
                name,
            } => {
                let branch = service
                    .create_branch(user, *conversation, *parent, name.clone())
                    .await
                    .map_err(|e| eyre!("Failed to create branch: {}", e))?;
                writeln!(stdout, "Created branch {} ({})", branch.name, branch.id)?;
            }
            BranchCommands::Switch {
                conversation,
                branch,
            } => {
                let view = service
                    .switch_branch(user, *conversation, *branch)
                    .await
                    .map_err(|e| eyre!("Failed to switch branch: {}", e))?;
                writeln!(stdout, "Switched to {}", view.branch.name)?;
                print_view(&mut stdout, &view)?;
            }
            BranchCommands::Delete {
                conversation,
                branch,
            } => {
                let deletion = service
                    .delete_branch(user, *conversation, *branch)
                    .await
                    .map_err(|e| eyre!("Failed to delete branch: {}", e))?;
                writeln!(stdout, "Deleted branch: {branch}")?;
                if let Some(activated) = deletion.activated {
                    writeln!(stdout, "Active branch is now: {activated}")?;
                }
            }
            BranchCommands::Show {
                conversation,
                branch,
            } => {
                let view = service
                    .branch_messages(user, *conversation, *branch)
                    .await
                    .map_err(|e| eyre!("Failed to load branch: {}", e))?;
                writeln!(stdout, "Branch {} ({})", view.branch.name, view.branch.id)?;
                print_view(&mut stdout, &view)?;
            }
        }

        Ok(())
    }
}

fn print_view(out: &mut impl Write, view: &BranchView) -> Result<()> {
    writeln!(out, "{}", messages_table(&view.messages.messages))?;
    if view.messages.partial {
        writeln!(out, "(thread truncated)")?;
    }
    Ok(())
}
