use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use super::{Detection, Detector};

/// Detector backed by an external inference program.
///
/// Each call spawns `program args...`, writes the frame as JPEG to its stdin and
/// expects a JSON array of detections on stdout.
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    classes: Vec<String>,
}

impl CommandDetector {
    pub fn new(program: PathBuf, args: Vec<String>, classes: Vec<String>) -> Self {
        Self {
            program,
            args,
            classes,
        }
    }

    /// Build a detector whose class list comes from a labels file, one label per line
    pub fn with_labels_file(program: PathBuf, args: Vec<String>, labels: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(labels)
            .with_context(|| format!("Failed to read labels file {labels:?}"))?;
        let classes = parse_labels(&content);
        if classes.is_empty() {
            return Err(anyhow!("Labels file {labels:?} contains no labels"));
        }
        Ok(Self::new(program, args, classes))
    }
}

fn parse_labels(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

impl Detector for CommandDetector {
    fn known_classes(&self) -> Vec<String> {
        self.classes.clone()
    }

    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let mut jpeg = Vec::new();
        JpegEncoder::new(&mut jpeg).encode_image(frame)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Executing detector command: {:?}", cmd);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn detector {:?}", self.program))?;

        // stdin is dropped after the write so the program sees EOF
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&jpeg),
            None => Ok(()),
        };

        if let Err(e) = written {
            // The program stopped reading; reap it and keep whatever it reported
            let output = child
                .wait_with_output()
                .context("Failed to reap detector after a broken stdin")?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "Detector stopped reading the frame ({}; {}): {}",
                e,
                output.status,
                stderr.trim()
            ));
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Detector exited with {}: {stderr}", output.status));
        }

        let detections: Vec<Detection> = serde_json::from_slice(&output.stdout)
            .context("Detector produced invalid JSON")?;
        Ok(detections)
    }
}
