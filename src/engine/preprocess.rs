//! Image preprocessing for YOLO detection models

use anyhow::{bail, Context, Result};
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;

/// Grey used by YOLO letterboxing
const PAD_VALUE: u8 = 114;

/// Letterbox an image into the model input and convert it to an NCHW RGB
/// tensor scaled to [0, 1]
pub fn preprocess_for_detection(image: &DynamicImage, input_size: (u32, u32)) -> Result<(Array4<f32>, ResizeInfo)> {
    let (orig_w, orig_h) = image.dimensions();
    if orig_w == 0 || orig_h == 0 {
        bail!("image has zero-size dimensions {}x{}", orig_w, orig_h);
    }

    let resize_info = ResizeInfo::new((orig_w, orig_h), input_size);
    let padded = letterbox(image, &resize_info, input_size);
    Ok((image_to_nchw(&padded), resize_info))
}

/// Resize with aspect ratio preserved and centre the result on a grey canvas
fn letterbox(image: &DynamicImage, info: &ResizeInfo, (target_w, target_h): (u32, u32)) -> RgbImage {
    let new_w = info.scaled_width.max(1);
    let new_h = info.scaled_height.max(1);

    let resized = image.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();

    let mut padded = RgbImage::from_pixel(target_w, target_h, image::Rgb([PAD_VALUE; 3]));
    image::imageops::replace(&mut padded, &resized, info.offset_x as i64, info.offset_y as i64);
    padded
}

fn image_to_nchw(rgb: &RgbImage) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        tensor[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        tensor[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    tensor
}

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data).context("undecodable image bytes")?;
    if image.width() == 0 || image.height() == 0 {
        bail!("image has zero-size dimensions");
    }
    Ok(apply_exif_orientation(data, image))
}

/// Wrap a raw RGB24 buffer (as produced by the video decoder) in an image
pub fn frame_from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<DynamicImage> {
    if width == 0 || height == 0 {
        bail!("frame has zero-size dimensions {}x{}", width, height);
    }
    let expected = width as usize * height as usize * 3;
    let actual = pixels.len();
    let buffer = RgbImage::from_raw(width, height, pixels)
        .with_context(|| format!("frame buffer holds {} bytes, expected {}", actual, expected))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Phones store rotation as an EXIF tag instead of rotating pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Geometry of a letterbox resize, used to map boxes back to the source image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeInfo {
    pub scale: f32,
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w as f32,
            target_h as f32 / orig_h as f32,
        );

        let scaled_width = ((orig_w as f32 * scale).round() as u32).min(target_w);
        let scaled_height = ((orig_h as f32 * scale).round() as u32).min(target_h);

        Self {
            scale,
            scaled_width,
            scaled_height,
            offset_x: (target_w - scaled_width) / 2,
            offset_y: (target_h - scaled_height) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert network-space coordinates back to original image space
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }

    pub fn clamp_x(&self, x: f32) -> f32 {
        x.clamp(0.0, self.original_width as f32)
    }

    pub fn clamp_y(&self, y: f32) -> f32 {
        y.clamp(0.0, self.original_height as f32)
    }
}
