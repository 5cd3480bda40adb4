use ab_glyph::{FontRef, PxScale};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

use crate::detector::Detection;

static LABEL_FONT: &[u8] = include_bytes!("../../assets/DejaVuSansMono.ttf");

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: PxScale = PxScale { x: 14.0, y: 14.0 };
const TAB_PADDING: u32 = 2;

/// Destination for annotated frames
pub trait ArtifactSink: Send + Sync {
    fn save(&self, path: &Path, image: &RgbImage) -> Result<()>;
}

/// Writes artifacts as JPEG files, creating parent directories on demand
pub struct JpegSink {
    quality: u8,
}

impl JpegSink {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegSink {
    fn default() -> Self {
        Self::new(90)
    }
}

impl ArtifactSink for JpegSink {
    fn save(&self, path: &Path, image: &RgbImage) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create artifact directory {parent:?}"))?;
        }
        let file = File::create(path).with_context(|| format!("Failed to create {path:?}"))?;
        JpegEncoder::new_with_quality(BufWriter::new(file), self.quality).encode_image(image)?;
        Ok(())
    }
}

/// `{root}/{name}/{name}_{YYYYmmdd_HHMMSS}.jpg`
///
/// Two ticks of the same stream within one second map to the same path.
pub fn artifact_path(root: &Path, stream_name: &str, at: &DateTime<Local>) -> PathBuf {
    let timestamp = at.format("%Y%m%d_%H%M%S");
    root.join(stream_name)
        .join(format!("{stream_name}_{timestamp}.jpg"))
}

/// Bundled label font, parsed on first use. `None` leaves artifacts with boxes only.
fn label_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(LABEL_FONT) {
        Ok(font) => Some(font),
        Err(e) => {
            warn!("Label font unusable, drawing boxes without labels: {}", e);
            None
        }
    })
    .as_ref()
}

/// Copy `frame` and draw every detection as a box with a `"{label} {confidence}"` tab
pub fn annotate(frame: &RgbImage, detections: &[Detection], classes: &[String]) -> RgbImage {
    let mut annotated = frame.clone();
    if annotated.width() == 0 || annotated.height() == 0 {
        return annotated;
    }
    let max_x = (annotated.width() - 1) as f32;
    let max_y = (annotated.height() - 1) as f32;

    for detection in detections {
        let label = match classes.get(detection.class_id) {
            Some(name) => format!("{} {:.2}", name, detection.confidence),
            None => format!("{} {:.2}", detection.class_id, detection.confidence),
        };
        // Clamped so boxes running off the frame still show their visible edges
        let bbox = &detection.bbox;
        let x1 = bbox.x1.round().clamp(0.0, max_x) as i32;
        let y1 = bbox.y1.round().clamp(0.0, max_y) as i32;
        let x2 = bbox.x2.round().clamp(0.0, max_x) as i32;
        let y2 = bbox.y2.round().clamp(0.0, max_y) as i32;
        let (left, top) = (x1.min(x2), y1.min(y2));
        let width = x1.abs_diff(x2) + 1;
        let height = y1.abs_diff(y2) + 1;

        for inset in 0..BOX_THICKNESS {
            let (w, h) = (
                width.saturating_sub(2 * inset),
                height.saturating_sub(2 * inset),
            );
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at(left + inset as i32, top + inset as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut annotated, rect, BOX_COLOR);
        }

        if let Some(font) = label_font() {
            draw_label(&mut annotated, font, left, top, &label);
        }
    }
    annotated
}

/// Filled tab sitting on top of the box's upper-left corner, moved inside the frame
/// when the box touches the top edge
fn draw_label(image: &mut RgbImage, font: &FontRef<'_>, x: i32, y: i32, text: &str) {
    let (text_width, text_height) = text_size(LABEL_SCALE, font, text);
    let tab_width = text_width + 2 * TAB_PADDING;
    let tab_height = text_height + 2 * TAB_PADDING;
    let tab_top = if y >= tab_height as i32 {
        y - tab_height as i32
    } else {
        y
    };

    draw_filled_rect_mut(
        image,
        Rect::at(x, tab_top).of_size(tab_width, tab_height),
        BOX_COLOR,
    );
    draw_text_mut(
        image,
        TEXT_COLOR,
        x + TAB_PADDING as i32,
        tab_top + TAB_PADDING as i32,
        LABEL_SCALE,
        font,
        text,
    );
}
