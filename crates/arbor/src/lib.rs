pub mod cli;
pub mod commands;

pub use arbor_core::{api, chat, config, domain, store, tree, utils};
