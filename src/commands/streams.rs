use anyhow::Result;

use crate::commands::resolve_streams;
use crate::config::Config;
use crate::stream::StreamDefinition;
use crate::OutputFormat;

/// Command to print the stream definitions a `run` would start
pub struct StreamsCommand {
    config: Config,
    format: OutputFormat,
}

impl StreamsCommand {
    pub fn new(config: Config, format: OutputFormat) -> Self {
        Self { config, format }
    }

    pub async fn execute(&self) -> Result<()> {
        let streams = resolve_streams(&self.config)?;
        println!("{}", self.render(&streams)?);
        Ok(())
    }

    fn render(&self, streams: &[StreamDefinition]) -> Result<String> {
        match self.format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(streams)?),
            OutputFormat::Table => Ok(render_table(streams)),
        }
    }
}

fn render_table(streams: &[StreamDefinition]) -> String {
    if streams.is_empty() {
        return "No streams configured.".to_string();
    }

    let name_width = streams
        .iter()
        .map(|s| s.name.chars().count())
        .max()
        .unwrap_or(0)
        .max("NAME".len());

    let mut out = format!("{:<6} {:<name_width$} URL", "ID", "NAME");
    for stream in streams {
        out.push('\n');
        out.push_str(&format!(
            "{:<6} {:<name_width$} {}",
            stream.id, stream.name, stream.url
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_aligns_columns() {
        let streams = vec![
            StreamDefinition::new(1, "lobby", "rtsp://lobby"),
            StreamDefinition::new(12, "parking-north", "rtsp://parking"),
        ];
        let table = render_table(&streams);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID     NAME"));
        assert_eq!(lines[1].find("rtsp://"), lines[2].find("rtsp://"));
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_table(&[]), "No streams configured.");
    }

    #[test]
    fn test_render_json() {
        let cmd = StreamsCommand::new(Config::default(), OutputFormat::Json);
        let json = cmd
            .render(&[StreamDefinition::new(3, "hall", "rtsp://hall")])
            .unwrap();
        let parsed: Vec<StreamDefinition> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0].name, "hall");
    }
}
