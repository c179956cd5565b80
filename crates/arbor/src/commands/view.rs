use arbor_core::domain::{ConversationId, MessageId};
use arbor_core::tree::{ConversationTree, TreeNode};
use async_trait::async_trait;
use chrono::Local;
use comfy_table::Cell;
use eyre::{Result, eyre};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use super::{Command, Context, header, messages_table, preview};

pub struct TreeCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
    pub json: bool,
}

#[async_trait]
impl Command for TreeCommand {
    async fn execute(&self) -> Result<()> {
        let tree = self
            .ctx
            .service
            .conversation_tree(&self.ctx.user, self.conversation)
            .await
            .map_err(|e| eyre!("Failed to build conversation tree: {}", e))?;

        let mut stdout = std::io::stdout();
        if self.json {
            writeln!(stdout, "{}", serde_json::to_string_pretty(&tree)?)?;
        } else {
            write!(stdout, "{}", render_tree(&tree))?;
        }
        Ok(())
    }
}

/// Indented outline of the tree. Branching points are marked with `*`.
pub fn render_tree(tree: &ConversationTree) -> String {
    let forks: HashSet<MessageId> = tree.branching_points.iter().copied().collect();
    let mut out = String::new();
    let mut stack: Vec<(&TreeNode, usize)> = tree.roots.iter().rev().map(|n| (n, 0)).collect();

    while let Some((node, depth)) = stack.pop() {
        let message = &node.message;
        let marker = if forks.contains(&message.id) { "*" } else { "-" };
        out.push_str(&format!(
            "{}{} [{}] {} ({})\n",
            "  ".repeat(depth),
            marker,
            message.role,
            preview(&message.content),
            message.id
        ));
        stack.extend(node.children.iter().rev().map(|c| (c, depth + 1)));
    }

    if tree.partial {
        out.push_str("(tree truncated)\n");
    }
    out
}

pub struct LineageCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
    pub message: MessageId,
}

#[async_trait]
impl Command for LineageCommand {
    async fn execute(&self) -> Result<()> {
        let path = self
            .ctx
            .service
            .lineage(&self.ctx.user, self.conversation, self.message)
            .await
            .map_err(|e| eyre!("Failed to load lineage: {}", e))?;

        writeln!(std::io::stdout(), "{}", messages_table(&path))?;
        Ok(())
    }
}

pub struct DocumentsCommand {
    pub ctx: Arc<Context>,
    pub conversation: ConversationId,
}

#[async_trait]
impl Command for DocumentsCommand {
    async fn execute(&self) -> Result<()> {
        let documents = self
            .ctx
            .service
            .conversation_documents(&self.ctx.user, self.conversation)
            .await
            .map_err(|e| eyre!("Failed to load documents: {}", e))?;

        let mut stdout = std::io::stdout();
        if documents.is_empty() {
            writeln!(stdout, "No documents linked.")?;
            return Ok(());
        }

        let mut table = header(&["Document", "Linked"]);
        for document in documents {
            table.add_row(vec![
                Cell::new(&document.document),
                Cell::new(
                    document
                        .linked_at
                        .with_timezone(&Local)
                        .format("%Y-%m-%d %H:%M:%S"),
                ),
            ]);
        }
        writeln!(stdout, "{table}")?;
        Ok(())
    }
}
