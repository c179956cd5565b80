pub mod api;
pub mod assignments;
pub mod chat;
pub mod config;
pub mod domain;
pub mod error;
pub mod registry;
pub mod store;
pub mod tree;
pub mod utils;

pub use chat::{ChatService, ChatSettings};
pub use error::{Error, Result};
