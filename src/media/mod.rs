//! Media handling: upload classification, URL fetching and video frame
//! extraction

pub mod remote;
pub mod video;

use std::fmt;

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ValidationError;

pub use remote::{parse_media_url, MediaFetcher, RemoteMedia};
pub use video::{FrameStream, VideoDecoder, VideoInfo};

/// What an upload contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const IMAGE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Gif,
    ImageFormat::Tiff,
];

/// ISO-BMFF brands that hold still images rather than video
const STILL_IMAGE_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis", b"heic", b"heix", b"mif1", b"msf1"];

/// Classify an upload by its leading bytes.
///
/// The declared content type is only used as a consistency check: it must be
/// absent, generic, or agree with what the bytes actually are.
pub fn classify(declared: Option<&str>, data: &[u8]) -> Result<MediaKind, ValidationError> {
    if data.is_empty() {
        return Err(ValidationError::EmptyUpload);
    }

    let declared = declared
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty());

    let declared_kind = match declared.as_deref() {
        None | Some("application/octet-stream") => None,
        Some(ct) if ct.starts_with("image/") => Some(MediaKind::Image),
        Some(ct) if ct.starts_with("video/") => Some(MediaKind::Video),
        Some(ct) => return Err(ValidationError::UnsupportedMediaType(ct.to_string())),
    };

    let sniffed = sniff(data).ok_or_else(|| {
        ValidationError::UnsupportedMediaType(
            declared
                .clone()
                .unwrap_or_else(|| "unrecognized content".to_string()),
        )
    })?;

    match declared_kind {
        Some(kind) if kind != sniffed => Err(ValidationError::UnsupportedMediaType(format!(
            "declared {} but content is {}",
            declared.unwrap_or_default(),
            sniffed
        ))),
        _ => Ok(sniffed),
    }
}

fn sniff(data: &[u8]) -> Option<MediaKind> {
    if is_video(data) {
        return Some(MediaKind::Video);
    }
    match image::guess_format(data) {
        Ok(format) if IMAGE_FORMATS.contains(&format) => Some(MediaKind::Image),
        _ => None,
    }
}

fn is_video(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }

    if &data[4..8] == b"ftyp" {
        let brand = &data[8..12];
        return !STILL_IMAGE_BRANDS.iter().any(|b| &b[..] == brand);
    }

    is_quicktime(data)
        || data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3])
        || (data.starts_with(b"RIFF") && &data[8..12] == b"AVI ")
        || data.starts_with(b"FLV\x01")
}

/// Old QuickTime files open with `moov`/`mdat` instead of `ftyp`, possibly
/// after `free`/`wide` padding atoms. Atom sizes must fit in the upload.
fn is_quicktime(data: &[u8]) -> bool {
    let mut offset = 0;
    for _ in 0..4 {
        let Some(header) = data.get(offset..offset + 8) else {
            return false;
        };
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        // 0 runs to end of file, 1 means a 64-bit size follows
        let plausible = size == 0 || size == 1 || (8..=data.len() - offset).contains(&size);
        if !plausible {
            return false;
        }
        match &header[4..8] {
            b"moov" | b"mdat" => return true,
            b"free" | b"wide" | b"skip" if size >= 8 => offset += size,
            _ => return false,
        }
    }
    false
}
