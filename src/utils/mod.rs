//! Utility functions

pub mod image;
