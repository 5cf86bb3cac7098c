//! Inference engine module
//!
//! Provides OpenVINO-based YOLO inference with:
//! - One-time model loading into a shared registry
//! - Letterbox preprocessing with EXIF orientation handling
//! - YOLOv5/YOLOv8 output decoding and NMS

pub mod loader;
pub mod detector;
pub mod labels;
pub mod preprocess;

#[cfg(test)]
pub(crate) mod fixture;

pub use loader::{ModelFamily, ModelLoader, ModelRegistry};
pub use detector::{BoundingBox, Detection, ObjectDetector, YoloDetector};
pub use labels::LabelSet;
