//! Image utility functions

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::engine::Detection;
use crate::service::counting::normalize_label;

const TARGET_COLOR: Rgb<u8> = Rgb([255, 40, 40]);
const OTHER_COLOR: Rgb<u8> = Rgb([40, 160, 255]);

/// Encode image to PNG bytes
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, image::ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Copy of `image` with a box around every detection. Boxes of the target
/// label are drawn thicker and in red.
pub fn draw_detections(image: &DynamicImage, detections: &[Detection], target_label: &str) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let target = normalize_label(target_label);

    for detection in detections {
        let is_target = normalize_label(&detection.label) == target;
        let (color, thickness) = if is_target {
            (TARGET_COLOR, 3)
        } else {
            (OTHER_COLOR, 1)
        };

        for inset in 0..thickness {
            if let Some(rect) = inset_rect(detection, inset, canvas.width(), canvas.height()) {
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }
        }
    }

    canvas
}

fn inset_rect(detection: &Detection, inset: i32, width: u32, height: u32) -> Option<Rect> {
    let bbox = &detection.bbox;
    let x = bbox.x.round() as i32 + inset;
    let y = bbox.y.round() as i32 + inset;
    let w = bbox.width.round() as i32 - 2 * inset;
    let h = bbox.height.round() as i32 - 2 * inset;

    if w <= 0 || h <= 0 || x >= width as i32 || y >= height as i32 {
        return None;
    }
    Some(Rect::at(x, y).of_size(w as u32, h as u32))
}
