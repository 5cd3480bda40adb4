pub mod artifact;
pub mod commands;
pub mod config;
pub mod detector;
pub mod error;
pub mod ffmpeg;
pub mod manager;
pub mod store;
pub mod stream;
pub mod worker;

use clap::ValueEnum;

/// Output format for commands that print stream information
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned plain-text table (default)
    Table,
    /// JSON array
    Json,
}
