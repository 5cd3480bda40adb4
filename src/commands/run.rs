use anyhow::{anyhow, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

use crate::artifact::JpegSink;
use crate::commands::resolve_streams;
use crate::config::Config;
use crate::detector::{CommandDetector, DetectorGate};
use crate::ffmpeg::FfmpegSourceFactory;
use crate::manager::Manager;
use crate::store::JsonFileStore;
use crate::stream::StreamDefinition;
use crate::worker::{Services, WorkerState};

const STATUS_INTERVAL: Duration = Duration::from_secs(300);

/// Command to start a worker for every configured stream and run until interrupted
pub struct RunCommand {
    config: Config,
}

impl RunCommand {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn execute(&self) -> Result<()> {
        let streams = resolve_streams(&self.config)?;
        if streams.is_empty() {
            return Err(anyhow!(
                "No streams configured. Set STREAMS_FILE or CAMERA_1_NAME / CAMERA_1_URL"
            ));
        }

        let detector = self.build_detector()?;

        let store = JsonFileStore::new(&self.config.data_dir);
        store.init()?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let services = Services {
            detector,
            sources: Arc::new(FfmpegSourceFactory::new(self.config.ffmpeg_settings())),
            store: Arc::new(store),
            sink: Arc::new(JpegSink::default()),
        };
        let manager = Manager::new(
            services,
            self.config.worker_settings(),
            self.config.stop_timeout(),
        )
        .with_open_timeout(self.config.open_timeout());

        info!(
            "✅ Starting {} streams, checking every {}s",
            streams.len(),
            self.config.check_interval
        );
        info!("Writing annotated frames to: {:?}", self.config.output_dir);

        supervise(&manager, streams, async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    fn build_detector(&self) -> Result<DetectorGate> {
        let command = self
            .config
            .detector_command
            .as_deref()
            .ok_or_else(|| anyhow!("DETECTOR_COMMAND is not set"))?;
        let labels = self
            .config
            .detector_labels
            .as_ref()
            .ok_or_else(|| anyhow!("DETECTOR_LABELS is not set"))?;

        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("DETECTOR_COMMAND is empty"))?;
        let detector = CommandDetector::with_labels_file(program, parts.collect(), labels)?;

        Ok(DetectorGate::new(detector))
    }
}

/// Load all streams into the manager, report on them periodically, and stop
/// everything once `shutdown` resolves
pub async fn supervise(
    manager: &Manager,
    streams: Vec<StreamDefinition>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let report = manager.load_all(streams).await;
    if report.started.is_empty() && !report.failed.is_empty() {
        warn!("⚠️ No stream could be started; waiting for shutdown anyway");
    }

    tokio::pin!(shutdown);
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("🛑 Shutdown signal received. Stopping workers.");
                break;
            }
            _ = status.tick() => {
                let workers = manager.list();
                for info in &workers {
                    debug!("Stream {} ({}): {}", info.stream.id, info.stream.name, info.state);
                }
                let running = workers
                    .iter()
                    .filter(|i| i.state == WorkerState::Running)
                    .count();
                info!("💡 {} of {} registered workers running", running, workers.len());
            }
        }
    }

    let failures = manager.stop_all().await;
    if !failures.is_empty() {
        warn!("{} workers failed to stop cleanly", failures.len());
    }
    info!("✅ All workers stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[tokio::test]
    #[serial]
    async fn test_run_without_streams_fails() {
        let config = Config {
            streams_file: None,
            ..Config::default()
        };
        std::env::remove_var("CAMERA_1_NAME");
        std::env::remove_var("CAMERA_1_URL");

        let result = RunCommand::new(config).execute().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_run_without_detector_fails() {
        let temp_dir = TempDir::new().unwrap();
        let streams_file = temp_dir.path().join("streams.json");
        std::fs::write(
            &streams_file,
            r#"[{"id": 1, "name": "lobby", "url": "rtsp://lobby"}]"#,
        )
        .unwrap();
        let config = Config {
            streams_file: Some(streams_file),
            detector_command: None,
            data_dir: temp_dir.path().join("data"),
            output_dir: temp_dir.path().join("output"),
            ..Config::default()
        };

        let err = RunCommand::new(config).execute().await.unwrap_err();
        assert!(err.to_string().contains("DETECTOR_COMMAND"));
    }

    #[tokio::test]
    async fn test_run_with_missing_streams_file_fails() {
        let config = Config {
            streams_file: Some(PathBuf::from("/nonexistent/streams.json")),
            ..Config::default()
        };

        let result = RunCommand::new(config).execute().await;
        assert!(result.is_err());
    }
}
