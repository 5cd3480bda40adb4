use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ffmpeg::FfmpegSettings;
use crate::worker::WorkerSettings;

/// Configuration for detection, output and worker behavior
#[derive(Debug, Clone)]
pub struct Config {
    pub confidence_threshold: f32,
    pub check_interval: u64,
    pub target_class: String,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub streams_file: Option<PathBuf>,
    pub stop_timeout: u64,
    pub open_timeout: u64,
    pub read_backoff_ms: u64,
    pub detector_command: Option<String>,
    pub detector_labels: Option<PathBuf>,
    pub ffmpeg_bin: PathBuf,
    pub frame_width: u32,
    pub frame_height: u32,
    pub stream_io_timeout: u64,
    pub max_reconnects: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            confidence_threshold: parsed_or(
                &lookup,
                "CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            check_interval: parsed_or(&lookup, "CHECK_INTERVAL", defaults.check_interval),
            target_class: lookup("TARGET_CLASS").unwrap_or(defaults.target_class),
            output_dir: lookup("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            data_dir: lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            streams_file: lookup("STREAMS_FILE").map(PathBuf::from),
            stop_timeout: parsed_or(&lookup, "STOP_TIMEOUT", defaults.stop_timeout),
            open_timeout: parsed_or(&lookup, "OPEN_TIMEOUT", defaults.open_timeout),
            read_backoff_ms: parsed_or(&lookup, "READ_BACKOFF_MS", defaults.read_backoff_ms),
            detector_command: lookup("DETECTOR_COMMAND").filter(|v| !v.trim().is_empty()),
            detector_labels: lookup("DETECTOR_LABELS").map(PathBuf::from),
            ffmpeg_bin: lookup("FFMPEG_BIN").map(PathBuf::from).unwrap_or(defaults.ffmpeg_bin),
            frame_width: parsed_or(&lookup, "FRAME_WIDTH", defaults.frame_width),
            frame_height: parsed_or(&lookup, "FRAME_HEIGHT", defaults.frame_height),
            stream_io_timeout: parsed_or(
                &lookup,
                "STREAM_IO_TIMEOUT",
                defaults.stream_io_timeout,
            ),
            max_reconnects: parsed_or(&lookup, "MAX_RECONNECTS", defaults.max_reconnects),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            check_interval: Duration::from_secs(self.check_interval),
            confidence_threshold: self.confidence_threshold,
            target_class: self.target_class.clone(),
            read_backoff: Duration::from_millis(self.read_backoff_ms),
            output_dir: self.output_dir.clone(),
        }
    }

    pub fn ffmpeg_settings(&self) -> FfmpegSettings {
        FfmpegSettings {
            ffmpeg_bin: self.ffmpeg_bin.clone(),
            width: self.frame_width,
            height: self.frame_height,
            io_timeout: Duration::from_secs(self.stream_io_timeout),
            max_reconnects: self.max_reconnects,
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout)
    }
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            check_interval: 60,
            target_class: "head".to_string(),
            output_dir: PathBuf::from("output"),
            data_dir: PathBuf::from("data"),
            streams_file: None,
            stop_timeout: 10,
            open_timeout: 30,
            read_backoff_ms: 1000,
            detector_command: None,
            detector_labels: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            frame_width: 640,
            frame_height: 480,
            stream_io_timeout: 10,
            max_reconnects: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.check_interval, 60);
        assert_eq!(config.confidence_threshold, 0.4);
        assert_eq!(config.target_class, "head");
        assert_eq!(config.output_dir, PathBuf::from("output"));
        assert!(config.detector_command.is_none());
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = [
            ("CHECK_INTERVAL", "15"),
            ("CONFIDENCE_THRESHOLD", "not-a-number"),
            ("OUTPUT_DIR", "/srv/frames"),
            ("FRAME_WIDTH", "1280"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.check_interval, 15);
        assert_eq!(config.confidence_threshold, 0.4);
        assert_eq!(config.output_dir, PathBuf::from("/srv/frames"));
        assert_eq!(config.frame_width, 1280);
        assert_eq!(config.frame_height, 480);
    }

    #[test]
    fn test_worker_settings() {
        let settings = Config::default().worker_settings();
        assert_eq!(settings.check_interval, Duration::from_secs(60));
        assert_eq!(settings.read_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_stream_timeouts() {
        let vars: HashMap<&str, &str> = [("OPEN_TIMEOUT", "5"), ("MAX_RECONNECTS", "0")]
            .into_iter()
            .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.open_timeout(), Duration::from_secs(5));
        let ffmpeg = config.ffmpeg_settings();
        assert_eq!(ffmpeg.max_reconnects, 0);
        assert_eq!(ffmpeg.io_timeout, Duration::from_secs(10));
    }
}
