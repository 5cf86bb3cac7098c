//! Image Analyzer Library
//!
//! Counts objects of a requested label in images and videos using a YOLO
//! detector compiled with OpenVINO.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::AnalyzerError;
