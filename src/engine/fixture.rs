//! Deterministic detector for tests
//!
//! Reports one `person` around pure-red pixels and one `dog` around
//! pure-green pixels, so test images can be painted with known contents.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use image::{DynamicImage, Rgb, RgbImage};

use super::detector::{BoundingBox, Detection, ObjectDetector};
use super::labels::LabelSet;
use super::loader::ModelFamily;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

pub struct FixtureDetector {
    name: String,
    labels: LabelSet,
    calls: AtomicUsize,
    delay: Option<Duration>,
    fail: bool,
}

impl FixtureDetector {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            labels: LabelSet::coco(),
            calls: AtomicUsize::new(0),
            delay: None,
            fail: false,
        }
    }

    pub fn new() -> Self {
        Self::named("fixture")
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn find(rgb: &RgbImage, color: Rgb<u8>) -> Option<BoundingBox> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in rgb.enumerate_pixels() {
            if *pixel == color {
                let b = bounds.get_or_insert((x, y, x, y));
                b.0 = b.0.min(x);
                b.1 = b.1.min(y);
                b.2 = b.2.max(x);
                b.3 = b.3.max(y);
            }
        }
        bounds.map(|(x1, y1, x2, y2)| BoundingBox {
            x: x1 as f32,
            y: y1 as f32,
            width: (x2 - x1 + 1) as f32,
            height: (y2 - y1 + 1) as f32,
        })
    }
}

impl ObjectDetector for FixtureDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Yolov8
    }

    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn detect(&self, image: &DynamicImage, _min_confidence: f32) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            bail!("fixture backend failure");
        }

        let rgb = image.to_rgb8();
        let mut detections = Vec::new();
        for (color, class_id, confidence) in [(RED, 0usize, 0.9f32), (GREEN, 16, 0.6)] {
            if let Some(bbox) = Self::find(&rgb, color) {
                detections.push(Detection {
                    label: self.labels.name(class_id).unwrap_or_default().to_string(),
                    class_id,
                    confidence,
                    bbox,
                });
            }
        }
        Ok(detections)
    }
}

/// PNG bytes of a grey canvas with the given filled squares
pub fn png_with(width: u32, height: u32, squares: &[(Rgb<u8>, u32, u32, u32)]) -> Vec<u8> {
    let mut image = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    for &(color, x0, y0, size) in squares {
        for y in y0..(y0 + size).min(height) {
            for x in x0..(x0 + size).min(width) {
                image.put_pixel(x, y, color);
            }
        }
    }

    let mut buffer = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, image::ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}
