//! Reelout Common Utilities
//!
//! Shared infrastructure for all Reelout crates:
//! - Error types and result aliases
//! - Frame rates and timecode formatting
//! - Cooperative cancellation flags
//! - Tracing/logging initialization
//! - Configuration loading

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod timecode;

pub use cancel::*;
pub use config::*;
pub use error::*;
pub use timecode::*;
