use arbor::cli::{Cli, Commands};
use arbor::commands::{
    Command, Context,
    branch::{BranchCommand, BranchesCommand},
    conversation::ConversationCommand,
    message::{AssignCommand, EditCommand, RegenerateCommand, SendCommand},
    view::{DocumentsCommand, LineageCommand, TreeCommand},
};
use clap::Parser;
use eyre::Result;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // Load .env file if it exists
    arbor::cli::config::load_env()?;

    // Level configured via RUST_LOG
    arbor_core::utils::tracing::init_tracing()?;

    let ctx = Context::open(cli.config, cli.db, cli.memory, cli.user).await?;
    debug!(target: "arbor::cli", user = %ctx.user, "Running command");

    let command: Box<dyn Command + Send + Sync> = match cli.command {
        Commands::Conversation { action } => Box::new(ConversationCommand { ctx, action }),
        Commands::Send {
            conversation,
            content,
        } => Box::new(SendCommand {
            ctx,
            conversation,
            content,
        }),
        Commands::Branches { conversation } => Box::new(BranchesCommand { ctx, conversation }),
        Commands::Branch { action } => Box::new(BranchCommand { ctx, action }),
        Commands::Assign {
            conversation,
            message,
            branch,
        } => Box::new(AssignCommand {
            ctx,
            conversation,
            message,
            branch,
        }),
        Commands::Edit { message, content } => Box::new(EditCommand {
            ctx,
            message,
            content,
        }),
        Commands::Regenerate { message } => Box::new(RegenerateCommand { ctx, message }),
        Commands::Tree { conversation, json } => Box::new(TreeCommand {
            ctx,
            conversation,
            json,
        }),
        Commands::Lineage {
            conversation,
            message,
        } => Box::new(LineageCommand {
            ctx,
            conversation,
            message,
        }),
        Commands::Documents { conversation } => Box::new(DocumentsCommand { ctx, conversation }),
    };

    command.execute().await
}
