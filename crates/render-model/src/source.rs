//! Interfaces to the layout side that produces frames.

use std::sync::Arc;

use reelout_common::{DeliveryResult, Fps};

use crate::bitmap::{Bitmap, BitmapSpec, Resolution};
use crate::tape::TapeSpan;

/// What a bitmap source should produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitmapRequest {
    pub spec: BitmapSpec,
    /// Opaque background colour (RGB, normalized) to draw under the content,
    /// or `None` to keep transparency.
    pub grounding: Option<[f32; 3]>,
    /// Largest sample value to keep, or `None` to let HDR highlights exceed 1.
    pub ceiling: Option<f32>,
}

/// Materializes frames of one video in one spec.
///
/// A source is single-writer: exactly one thread calls it at a time.
/// Dropping the source releases it.
pub trait BitmapSource: Send {
    /// Produce frame `index`. `Ok(None)` signals end of stream.
    fn materialize_frame(&mut self, index: u64) -> DeliveryResult<Option<Bitmap>>;

    /// Hint that frame `index` will be requested soon.
    fn preload_frame(&mut self, _index: u64) {}
}

/// A laid-out, resolution independent video.
pub trait DeferredVideo: Send + Sync {
    fn resolution(&self) -> Resolution;

    fn fps(&self) -> Fps;

    fn num_frames(&self) -> u64;

    /// Copy with the resolution scaled by `resolution_scaling` and every frame
    /// repeated `fps_scaling` times at a correspondingly higher frame rate.
    fn rescaled(&self, resolution_scaling: f64, fps_scaling: u32) -> Arc<dyn DeferredVideo>;

    fn bitmap_source(&self, request: &BitmapRequest) -> DeliveryResult<Box<dyn BitmapSource>>;

    /// Tape appearances, in any order.
    fn tape_spans(&self) -> Vec<TapeSpan>;
}
