//! API module - REST handlers and OpenAPI docs

pub mod docs;
pub mod dto;
pub mod rest;

pub use rest::{create_rest_router, AppState};
