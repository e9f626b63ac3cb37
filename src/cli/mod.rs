//! CLI module - argument parsing, commands and output helpers

pub mod args;
pub mod commands;
pub mod output;

pub use args::{Cli, Commands};
