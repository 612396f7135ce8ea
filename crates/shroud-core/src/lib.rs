//! Shroud Core Library
//!
//! Shared functionality for Shroud components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, FallbackMode, PendingPolicy};
pub use error::{Error, Result};
