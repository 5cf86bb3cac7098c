//! Service layer module

pub mod analyzer_service;
pub mod counting;
pub mod types;

pub use analyzer_service::AnalyzerService;
pub use types::*;
