//! Reelout Render Model
//!
//! Data contracts of the delivery pipeline:
//! - **Configuration algebra:** typed properties, configs, and assortments of legal configs
//! - **Bitmaps:** owned frame buffers with specs and an allocation ledger
//! - **Sources:** the deferred video and bitmap source interfaces the layout side implements
//! - **Tapes:** footage references used by timeline exports

pub mod assortment;
pub mod bitmap;
pub mod color;
pub mod config;
pub mod property;
pub mod source;
pub mod tape;

pub use assortment::*;
pub use bitmap::*;
pub use color::*;
pub use config::*;
pub use property::*;
pub use source::*;
pub use tape::*;
