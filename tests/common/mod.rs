//! Fake collaborators shared by the integration tests

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use streamcount::artifact::ArtifactSink;
use streamcount::detector::{BoundingBox, Detection, Detector, DetectorGate};
use streamcount::error::OpenError;
use streamcount::ffmpeg::{FrameSource, FrameSourceFactory, ReadOutcome};
use streamcount::manager::Manager;
use streamcount::store::MemoryStore;
use streamcount::worker::{Services, WorkerSettings};

pub const HEAD: usize = 1;

pub fn classes() -> Vec<String> {
    vec!["person".to_string(), "head".to_string()]
}

/// Yields the same frame on every read, optionally a limited number of times
pub struct FakeSource {
    frame: RgbImage,
    remaining: Option<usize>,
    delay: Duration,
    reads: Arc<AtomicUsize>,
}

impl FrameSource for FakeSource {
    fn read(&mut self) -> ReadOutcome {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.remaining.as_mut() {
            Some(0) => return ReadOutcome::Closed,
            Some(n) => *n -= 1,
            None => {}
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        ReadOutcome::Frame(self.frame.clone())
    }
}

pub struct FakeSourceFactory {
    pub frames_per_open: Option<usize>,
    pub read_delay: Duration,
    pub unreachable: HashSet<String>,
    pub slow_opens: HashMap<String, Duration>,
    pub opens: AtomicUsize,
    pub reads: Arc<AtomicUsize>,
}

impl FakeSourceFactory {
    /// Endless source producing a frame every `read_delay`
    pub fn endless(read_delay: Duration) -> Self {
        Self {
            frames_per_open: None,
            read_delay,
            unreachable: HashSet::new(),
            slow_opens: HashMap::new(),
            opens: AtomicUsize::new(0),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Source that closes after `frames` reads
    pub fn finite(frames: usize) -> Self {
        Self {
            frames_per_open: Some(frames),
            ..Self::endless(Duration::ZERO)
        }
    }

    pub fn with_unreachable(mut self, address: &str) -> Self {
        self.unreachable.insert(address.to_string());
        self
    }

    /// Opening `address` blocks for `delay` before succeeding
    pub fn with_slow_open(mut self, address: &str, delay: Duration) -> Self {
        self.slow_opens.insert(address.to_string(), delay);
        self
    }
}

impl FrameSourceFactory for FakeSourceFactory {
    fn open(&self, address: &str) -> Result<Box<dyn FrameSource>, OpenError> {
        if self.unreachable.contains(address) {
            return Err(OpenError::new(address, "connection refused"));
        }
        if let Some(delay) = self.slow_opens.get(address) {
            std::thread::sleep(*delay);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            frame: RgbImage::from_pixel(64, 48, Rgb([40, 40, 40])),
            remaining: self.frames_per_open,
            delay: self.read_delay,
            reads: self.reads.clone(),
        }))
    }
}

/// Detector that records call overlap and can fail its first calls
#[derive(Clone, Default)]
pub struct CallStats {
    pub calls: Arc<AtomicUsize>,
    pub overlaps: Arc<AtomicUsize>,
    in_call: Arc<AtomicBool>,
}

pub struct FakeDetector {
    pub stats: CallStats,
    pub heads: usize,
    pub fail_first: usize,
    pub delay: Duration,
}

impl FakeDetector {
    pub fn new(heads: usize) -> Self {
        Self {
            stats: CallStats::default(),
            heads,
            fail_first: 0,
            delay: Duration::ZERO,
        }
    }
}

impl Detector for FakeDetector {
    fn known_classes(&self) -> Vec<String> {
        classes()
    }

    fn infer(&mut self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        if self.stats.in_call.swap(true, Ordering::SeqCst) {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let call = self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.stats.in_call.store(false, Ordering::SeqCst);

        if call < self.fail_first {
            return Err(anyhow!("injected inference failure"));
        }

        let mut detections: Vec<Detection> = (0..self.heads)
            .map(|i| Detection {
                class_id: HEAD,
                confidence: 0.9,
                bbox: BoundingBox::new(4.0 + i as f32 * 10.0, 10.0, 12.0 + i as f32 * 10.0, 30.0),
            })
            .collect();
        // Neither of these qualifies
        detections.push(Detection {
            class_id: HEAD,
            confidence: 0.1,
            bbox: BoundingBox::new(0.0, 0.0, 5.0, 5.0),
        });
        detections.push(Detection {
            class_id: 0,
            confidence: 0.99,
            bbox: BoundingBox::new(0.0, 0.0, 20.0, 40.0),
        });
        Ok(detections)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub saved: Mutex<Vec<PathBuf>>,
}

impl ArtifactSink for RecordingSink {
    fn save(&self, path: &Path, _image: &RgbImage) -> Result<()> {
        self.saved.lock().push(path.to_path_buf());
        Ok(())
    }
}

/// Sink whose every save fails
#[derive(Default)]
pub struct FailingSink {
    pub attempts: AtomicUsize,
}

impl ArtifactSink for FailingSink {
    fn save(&self, _path: &Path, _image: &RgbImage) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("read-only file system"))
    }
}

pub fn settings(check_interval: Duration) -> WorkerSettings {
    WorkerSettings {
        check_interval,
        confidence_threshold: 0.4,
        target_class: "head".to_string(),
        read_backoff: Duration::from_millis(5),
        output_dir: PathBuf::from("output"),
    }
}

pub struct Harness {
    pub manager: Manager,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub sources: Arc<FakeSourceFactory>,
}

pub fn harness(
    detector: FakeDetector,
    sources: FakeSourceFactory,
    settings: WorkerSettings,
    stop_timeout: Duration,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let sources = Arc::new(sources);
    let services = Services {
        detector: DetectorGate::new(detector),
        sources: sources.clone(),
        store: store.clone(),
        sink: sink.clone(),
    };
    Harness {
        manager: Manager::new(services, settings, stop_timeout),
        store,
        sink,
        sources,
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
