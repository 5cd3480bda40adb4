//! Object detection capability shared by every stream worker.
//!
//! A single [`Detector`] instance lives for the whole process. Workers never touch it
//! directly: they go through a cloned [`DetectorGate`], which lends the detector out
//! under an exclusive lock for exactly one call.

use anyhow::Result;
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod command;

pub use command::CommandDetector;

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// A single detection produced by one inference call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// An object detection model.
///
/// Implementations may assume they are never called concurrently; the gate
/// guarantees it.
pub trait Detector: Send {
    /// Class labels, indexed by class id
    fn known_classes(&self) -> Vec<String>;

    /// Run inference on one frame
    fn infer(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// Exclusive-access handle around the process-wide detector
#[derive(Clone)]
pub struct DetectorGate {
    inner: Arc<Mutex<Box<dyn Detector>>>,
}

impl DetectorGate {
    pub fn new(detector: impl Detector + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(detector))),
        }
    }

    pub fn known_classes(&self) -> Vec<String> {
        self.inner.lock().known_classes()
    }

    /// Block until the detector is free, run one inference, release immediately
    pub fn infer(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let mut detector = self.inner.lock();
        detector.infer(frame)
    }
}

/// How detections are matched against the target class.
///
/// Resolved once per worker: when the label is present in the detector's class
/// list, matching is a plain integer compare; otherwise every detection's label is
/// looked up and compared case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassFilter {
    Index(usize),
    Label { target: String, classes: Vec<String> },
}

impl ClassFilter {
    pub fn resolve(target: &str, classes: Vec<String>) -> Self {
        let target = target.to_lowercase();
        match classes.iter().position(|c| c.to_lowercase() == target) {
            Some(index) => ClassFilter::Index(index),
            None => ClassFilter::Label { target, classes },
        }
    }

    pub fn matches(&self, class_id: usize) -> bool {
        match self {
            ClassFilter::Index(index) => class_id == *index,
            ClassFilter::Label { target, classes } => classes
                .get(class_id)
                .map(|label| label.to_lowercase() == *target)
                .unwrap_or(false),
        }
    }

    /// Keep detections at or above `threshold` that match the filter
    pub fn apply(&self, detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= threshold && self.matches(d.class_id))
            .collect()
    }
}
