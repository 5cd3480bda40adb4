//! # Streamcount - Stream Detection Supervisor
//!
//! Watches a set of video streams, periodically counts a target object class in
//! each of them with one shared detector, and keeps the latest count, a count
//! history and an annotated frame per check.
//!
//! ## Features
//!
//! - **One Worker per Stream**: Each stream is read continuously by its own worker
//! - **Shared Detector**: Inference is serialized through a single exclusive gate
//! - **Throttled Checks**: Frames are read at stream rate, inference runs once per interval
//! - **Failure Isolation**: A bad frame or a dead stream never affects the others
//! - **Signal Handling**: Graceful shutdown on SIGINT
//!
//! ## Usage
//!
//! ```bash
//! # Start workers for every configured stream
//! streamcount run --streams-file streams.json
//!
//! # Show the streams that would be started
//! streamcount streams --format json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamcount::commands::{run::RunCommand, streams::StreamsCommand};
use streamcount::config::Config;
use streamcount::OutputFormat;

/// Streamcount - supervise video stream workers sharing one detector
#[derive(Parser)]
#[command(
    name = "streamcount",
    about = "Supervises video stream workers that share one object detector",
    long_about = "Reads every configured stream continuously, counts the target class once per check interval, and stores counts and annotated frames.",
    version
)]
struct Cli {
    /// JSON file with stream definitions ([{"id", "name", "url"}, ...])
    #[arg(long, short = 's', global = true, env = "STREAMS_FILE")]
    streams_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Start a worker per stream and run until interrupted
    Run {
        /// Directory for annotated frames
        #[arg(long, short = 'o')]
        output_dir: Option<PathBuf>,
        /// Seconds between two checks of the same stream
        #[arg(long, short = 'i')]
        check_interval: Option<u64>,
    },
    /// List the configured stream definitions
    Streams {
        /// Output format
        #[arg(long, short = 'f', value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamcount=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env();
    if cli.streams_file.is_some() {
        config.streams_file = cli.streams_file;
    }

    let result = match cli.command {
        Commands::Run {
            output_dir,
            check_interval,
        } => {
            if let Some(output_dir) = output_dir {
                config.output_dir = output_dir;
            }
            if let Some(check_interval) = check_interval {
                config.check_interval = check_interval;
            }
            info!(
                "Starting run command with streams file: {:?}, output: {:?}",
                config.streams_file, config.output_dir
            );
            RunCommand::new(config).execute().await
        }
        Commands::Streams { format } => StreamsCommand::new(config, format).execute().await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
