use arbor_core::chat::{ChatService, ChatSettings};
use arbor_core::config::{ArborConfig, StoreConfig};
use arbor_core::domain::{Message, UserId};
use async_trait::async_trait;
use comfy_table::{Cell, Color, Table};
use eyre::{Result, eyre};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub mod branch;
pub mod conversation;
pub mod message;
pub mod view;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Everything a command needs: the service and who is calling it.
pub struct Context {
    pub service: ChatService,
    pub user: UserId,
}

impl Context {
    pub async fn open(
        config_path: Option<PathBuf>,
        db: Option<PathBuf>,
        memory: bool,
        user: String,
    ) -> Result<Arc<Self>> {
        let config = match config_path {
            Some(path) => ArborConfig::load_from(&path),
            None => ArborConfig::load(),
        }
        .map_err(|e| eyre!("Failed to load config: {}", e))?;

        let store_config = if memory {
            StoreConfig::Memory
        } else if let Some(path) = db {
            StoreConfig::sqlite(path)
        } else {
            config.store.clone()
        };
        debug!(target: "arbor::cli", store = ?store_config, "Opening store");

        let store = store_config
            .open()
            .await
            .map_err(|e| eyre!("Failed to open conversation store: {}", e))?;

        Ok(Arc::new(Self {
            service: ChatService::new(store).with_settings(ChatSettings::from(&config)),
            user: UserId::new(user),
        }))
    }
}

const PREVIEW_CHARS: usize = 60;

pub(crate) fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    let mut out: String = line.chars().take(PREVIEW_CHARS).collect();
    if line.chars().count() > PREVIEW_CHARS || content.lines().count() > 1 {
        out.push_str("...");
    }
    out
}

pub(crate) fn header(columns: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_header(
        columns
            .iter()
            .map(|c| Cell::new(c).fg(Color::Green))
            .collect::<Vec<_>>(),
    );
    table
}

pub(crate) fn messages_table(messages: &[Message]) -> Table {
    let mut table = header(&["ID", "Role", "Parent", "Content"]);
    for message in messages {
        table.add_row(vec![
            Cell::new(message.id),
            Cell::new(message.role),
            Cell::new(
                message
                    .parent_message_id
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(preview(&message.content)),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_cuts_long_and_multiline_content() {
        assert_eq!(preview("short"), "short");
        assert_eq!(preview("first\nsecond"), "first...");
        let long = "x".repeat(80);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(60)));
    }

    #[tokio::test]
    async fn memory_context_ignores_config_store() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::open(
            Some(dir.path().join("missing.toml")),
            None,
            true,
            "tester".to_string(),
        )
        .await
        .unwrap();

        let conversation = ctx
            .service
            .create_conversation(&ctx.user, None)
            .await
            .unwrap();
        assert_eq!(conversation.user_id.as_str(), "tester");
        assert!(!dir.path().join("arbor.db").exists());
    }
}
