mod branch;
mod conversation;
mod ids;
mod message;

pub use branch::{
    Branch, BranchSummary, MAIN_BRANCH_NAME, MessageBranchAssignment, ORIGINAL_BRANCH_NAME,
    numbered_branch_name,
};
pub use conversation::{Conversation, ConversationDocument, DEFAULT_CONVERSATION_TITLE};
pub use ids::{BranchId, ConversationId, MessageId, UserId};
pub use message::{Message, Role, Turn};
