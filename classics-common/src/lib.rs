//! # Compel Classics Common Library
//!
//! Shared code for the pipeline crates including:
//! - Error type and result alias
//! - Configuration loading and validation
//! - Database initialization and lock-contention retry
//! - Human-readable duration formatting

pub mod config;
pub mod db;
pub mod error;
pub mod human_time;

pub use config::PipelineConfig;
pub use error::{Error, Result};
