pub mod args;
pub mod config;

pub use args::*;
