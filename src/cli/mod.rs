//! CLI layer for the audit engine.
//!
//! Provides the command-line interface using clap, with commands for
//! initializing the database, registering documents, running and resuming
//! audits, and inspecting flags and scores.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::execute;
pub use output::OutputFormat;
pub use parser::{AuditCommands, Cli, Commands};
