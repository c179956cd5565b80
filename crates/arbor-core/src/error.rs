use thiserror::Error;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConversationNotFound { conversation_id } => {
                Error::NotFound(format!("conversation {conversation_id}"))
            }
            StoreError::BranchNotFound { branch_id } => {
                Error::NotFound(format!("branch {branch_id}"))
            }
            StoreError::MessageNotFound { message_id } => {
                Error::NotFound(format!("message {message_id}"))
            }
            StoreError::LastBranch { conversation_id } => Error::InvalidOperation(format!(
                "cannot delete the last branch of conversation {conversation_id}"
            )),
            other => Error::Store(other),
        }
    }
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }
}
