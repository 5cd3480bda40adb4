pub mod run;
pub mod streams;

use anyhow::Result;
use tracing::debug;

use crate::config::Config;
use crate::stream::{self, StreamDefinition};

/// Stream definitions from the configured streams file, plus any
/// `CAMERA_{i}_*` variables whose identity the file does not already use
pub fn resolve_streams(config: &Config) -> Result<Vec<StreamDefinition>> {
    let from_file = match &config.streams_file {
        Some(path) => stream::load_from_file(path)?,
        None => Vec::new(),
    };
    let from_env = stream::load_from_env();
    debug!(
        "Resolved {} streams from file and {} from environment",
        from_file.len(),
        from_env.len()
    );
    let streams = stream::merge(from_file, from_env);
    for stream in &streams {
        stream.validate()?;
    }
    Ok(streams)
}
