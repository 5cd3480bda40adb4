use image::RgbImage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::OpenError;

/// Lines of ffmpeg stderr kept for error reports
const STDERR_TAIL_LINES: usize = 8;

/// Result of one attempt to read a frame
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RgbImage),
    /// Nothing available right now; worth retrying after a short pause
    Empty,
    /// The source is gone for good
    Closed,
}

/// An opened video stream
pub trait FrameSource: Send {
    fn read(&mut self) -> ReadOutcome;

    /// Release the underlying stream. Called once when the worker exits.
    fn release(&mut self) {}
}

/// Opens frame sources by address
pub trait FrameSourceFactory: Send + Sync {
    fn open(&self, address: &str) -> Result<Box<dyn FrameSource>, OpenError>;
}

/// Decode settings for the ffmpeg-backed source
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_bin: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Network read/connect timeout handed to ffmpeg
    pub io_timeout: Duration,
    /// Consecutive respawns after ffmpeg exits before the stream counts as closed
    pub max_reconnects: u32,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            width: 640,
            height: 480,
            io_timeout: Duration::from_secs(10),
            max_reconnects: 5,
        }
    }
}

/// Build the ffmpeg command decoding `address` to raw RGB24 at the configured resolution
fn build_command(settings: &FfmpegSettings, address: &str) -> Command {
    let mut cmd = Command::new(&settings.ffmpeg_bin);
    cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);

    let timeout_us = settings.io_timeout.as_micros().to_string();
    if address.starts_with("rtsp://") {
        cmd.args(["-rtsp_transport", "tcp", "-timeout", timeout_us.as_str()]);
    } else if address.contains("://") {
        cmd.args(["-rw_timeout", timeout_us.as_str()]);
    }

    cmd.args(["-i", address]);
    let scale = format!("scale={}:{}", settings.width, settings.height);
    cmd.args([
        "-an",
        "-vf",
        scale.as_str(),
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "pipe:1",
    ]);
    cmd
}

/// Opens streams by spawning ffmpeg and decoding to raw RGB24 on stdout
pub struct FfmpegSourceFactory {
    settings: FfmpegSettings,
}

impl FfmpegSourceFactory {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }
}

impl FrameSourceFactory for FfmpegSourceFactory {
    fn open(&self, address: &str) -> Result<Box<dyn FrameSource>, OpenError> {
        let mut process = FfmpegProcess::spawn(build_command(&self.settings, address))
            .map_err(|e| OpenError::new(address, e))?;

        // ffmpeg only fails on an unreachable input once it tries to read it,
        // so the first frame decides whether the stream opened
        match process.read_frame(self.settings.width, self.settings.height) {
            Ok(frame) => Ok(Box::new(FfmpegSource {
                address: address.to_string(),
                settings: self.settings.clone(),
                process: Some(process),
                pending: Some(frame),
                reconnects: 0,
            })),
            Err(e) => {
                let stderr = process.shutdown();
                let reason = if stderr.is_empty() {
                    format!("no frames decoded ({e})")
                } else {
                    format!("no frames decoded: {stderr}")
                };
                Err(OpenError::new(address, reason))
            }
        }
    }
}

/// Collects the last few stderr lines of a child on a background thread
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn spawn(stderr: ChildStderr) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let sink = lines.clone();
        let reader = std::thread::Builder::new()
            .name("ffmpeg-stderr".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    let mut lines = sink.lock();
                    if lines.len() == STDERR_TAIL_LINES {
                        lines.pop_front();
                    }
                    lines.push_back(line);
                }
            })
            .map_err(|e| warn!("Cannot capture ffmpeg stderr: {}", e))
            .ok();
        Self { lines, reader }
    }

    /// Wait for the pipe to close and return what was collected
    fn finish(&mut self) -> String {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join(" | ")
    }
}

/// One running ffmpeg child
struct FfmpegProcess {
    child: Child,
    stdout: ChildStdout,
    stderr: StderrTail,
}

impl FfmpegProcess {
    fn spawn(mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Executing FFmpeg command: {:?}", cmd);

        let mut child = cmd.spawn()?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("ffmpeg pipes not captured"));
        };
        Ok(Self {
            child,
            stdout,
            stderr: StderrTail::spawn(stderr),
        })
    }

    fn read_frame(&mut self, width: u32, height: u32) -> io::Result<RgbImage> {
        let mut buf = vec![0u8; width as usize * height as usize * 3];
        self.stdout.read_exact(&mut buf)?;
        RgbImage::from_raw(width, height, buf)
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "frame size mismatch"))
    }

    /// Kill and reap the child, returning its stderr tail
    fn shutdown(mut self) -> String {
        if let Err(e) = self.child.kill() {
            debug!("FFmpeg already exited: {}", e);
        }
        if let Err(e) = self.child.wait() {
            warn!("Failed to reap FFmpeg: {}", e);
        }
        self.stderr.finish()
    }
}

/// Opened ffmpeg stream. When ffmpeg exits mid-stream it is respawned, reporting
/// `Empty` meanwhile, until `max_reconnects` consecutive attempts yield no frame.
struct FfmpegSource {
    address: String,
    settings: FfmpegSettings,
    process: Option<FfmpegProcess>,
    pending: Option<RgbImage>,
    reconnects: u32,
}

impl FfmpegSource {
    fn reconnect(&mut self) -> ReadOutcome {
        if self.reconnects >= self.settings.max_reconnects {
            warn!(
                "Giving up on {} after {} reconnect attempts",
                self.address, self.reconnects
            );
            return ReadOutcome::Closed;
        }
        self.reconnects += 1;
        info!(
            "Reconnecting to {} (attempt {}/{})",
            self.address, self.reconnects, self.settings.max_reconnects
        );

        match FfmpegProcess::spawn(build_command(&self.settings, &self.address)) {
            Ok(process) => self.process = Some(process),
            Err(e) => warn!("Failed to respawn FFmpeg: {}", e),
        }
        ReadOutcome::Empty
    }
}

impl FrameSource for FfmpegSource {
    fn read(&mut self) -> ReadOutcome {
        if let Some(frame) = self.pending.take() {
            return ReadOutcome::Frame(frame);
        }
        let Some(process) = self.process.as_mut() else {
            return self.reconnect();
        };

        match process.read_frame(self.settings.width, self.settings.height) {
            Ok(frame) => {
                self.reconnects = 0;
                ReadOutcome::Frame(frame)
            }
            Err(e) => {
                let stderr = self
                    .process
                    .take()
                    .map(FfmpegProcess::shutdown)
                    .unwrap_or_default();
                warn!("FFmpeg stream interrupted ({}): {}", e, stderr);
                self.reconnect()
            }
        }
    }

    fn release(&mut self) {
        if let Some(process) = self.process.take() {
            let stderr = process.shutdown();
            if !stderr.is_empty() {
                debug!("FFmpeg stderr on release: {}", stderr);
            }
        }
    }
}
