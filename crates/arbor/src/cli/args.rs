use arbor_core::domain::{BranchId, ConversationId, MessageId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Branching chat conversations: edit any earlier message without losing
/// what came after it.
#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the conversation database (defaults to ~/.arbor/arbor.db)
    #[arg(long, env = "ARBOR_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Keep everything in memory for this run
    #[arg(long, global = true, conflicts_with = "db")]
    pub memory: bool,

    /// User the commands act as
    #[arg(long, env = "ARBOR_USER", default_value = "local", global = true)]
    pub user: String,

    /// Path to the config file (defaults to <config dir>/arbor/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Manage conversations
    Conversation {
        #[command(subcommand)]
        action: ConversationCommands,
    },
    /// Send a message on the active branch
    Send {
        conversation: ConversationId,
        content: String,
    },
    /// List the branches of a conversation and show the active one
    Branches { conversation: ConversationId },
    /// Manage a single branch
    Branch {
        #[command(subcommand)]
        action: BranchCommands,
    },
    /// Add an existing message to a branch
    Assign {
        conversation: ConversationId,
        message: MessageId,
        branch: BranchId,
    },
    /// Edit a user message, forking a new branch
    Edit { message: MessageId, content: String },
    /// Ask for a different reply to a user message on a new branch
    Regenerate { message: MessageId },
    /// Show every message of a conversation as a tree
    Tree {
        conversation: ConversationId,
        /// Print JSON instead of an indented tree
        #[arg(long)]
        json: bool,
    },
    /// Show the path from the first message to the given one
    Lineage {
        conversation: ConversationId,
        message: MessageId,
    },
    /// List documents cited in a conversation
    Documents { conversation: ConversationId },
}

#[derive(Subcommand, Clone)]
pub enum ConversationCommands {
    /// Start a new conversation
    New {
        #[arg(long)]
        title: Option<String>,
    },
    /// List conversations, most recently updated first
    List,
    /// Delete a conversation and everything in it
    Delete { conversation: ConversationId },
}

#[derive(Subcommand, Clone)]
pub enum BranchCommands {
    /// Create a branch and make it active
    Create {
        conversation: ConversationId,
        #[arg(long)]
        parent: Option<BranchId>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Make a branch active and show its messages
    Switch {
        conversation: ConversationId,
        branch: BranchId,
    },
    /// Delete a branch (the last one is kept)
    Delete {
        conversation: ConversationId,
        branch: BranchId,
    },
    /// Show a branch's messages without switching to it
    Show {
        conversation: ConversationId,
        branch: BranchId,
    },
}
