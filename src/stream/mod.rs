use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Opaque identity of a stream, as assigned by whatever owns the definitions
pub type StreamId = u64;

/// One externally supplied stream definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDefinition {
    pub id: StreamId,
    pub name: String,
    pub url: String,
}

impl StreamDefinition {
    pub fn new(id: StreamId, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into(),
        }
    }

    /// Check that the definition can be turned into a worker
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("Stream {} has an empty name", self.id));
        }
        if self.url.trim().is_empty() {
            return Err(anyhow!("Stream {} ({}) has an empty url", self.id, self.name));
        }
        // The name becomes a directory and file prefix for artifacts
        if self.name.contains(&['/', '\\'][..]) || self.name == "." || self.name == ".." {
            return Err(anyhow!(
                "Stream {} name {:?} cannot be used as a directory name",
                self.id,
                self.name
            ));
        }
        Ok(())
    }
}

/// Load stream definitions from a JSON file holding an array of definitions
pub fn load_from_file(path: &Path) -> Result<Vec<StreamDefinition>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read streams file {path:?}"))?;
    let streams: Vec<StreamDefinition> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse streams file {path:?}"))?;
    check_all(&streams)?;
    debug!("Loaded {} stream definitions from {:?}", streams.len(), path);
    Ok(streams)
}

/// Collect `CAMERA_{i}_NAME` / `CAMERA_{i}_URL` pairs, starting at 1 and stopping
/// at the first index where either variable is missing. The index is the identity.
pub fn load_from_env() -> Vec<StreamDefinition> {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Vec<StreamDefinition> {
    let mut streams = Vec::new();
    for index in 1.. {
        let name = lookup(&format!("CAMERA_{index}_NAME")).filter(|v| !v.is_empty());
        let url = lookup(&format!("CAMERA_{index}_URL")).filter(|v| !v.is_empty());
        match (name, url) {
            (Some(name), Some(url)) => streams.push(StreamDefinition::new(index, name, url)),
            _ => break,
        }
    }
    streams
}

/// Merge two definition sets; entries from `primary` win on identity clashes
pub fn merge(
    primary: Vec<StreamDefinition>,
    secondary: Vec<StreamDefinition>,
) -> Vec<StreamDefinition> {
    let taken: HashSet<StreamId> = primary.iter().map(|s| s.id).collect();
    let mut merged = primary;
    merged.extend(secondary.into_iter().filter(|s| !taken.contains(&s.id)));
    merged.sort_by_key(|s| s.id);
    merged
}

fn check_all(streams: &[StreamDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for stream in streams {
        stream.validate()?;
        if !seen.insert(stream.id) {
            return Err(anyhow!("Duplicate stream id {}", stream.id));
        }
    }
    Ok(())
}
