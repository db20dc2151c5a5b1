//! CLI module for xenstore-client - command-line interface and output.

pub mod commands;
pub mod render;

pub use commands::Cli;
