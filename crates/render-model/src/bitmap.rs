//! Owned frame bitmaps and their specs.
//!
//! A [`Bitmap`] stores normalized `f32` samples in one plane per channel.
//! Storage is released when the bitmap is dropped; `close()` is the explicit
//! spelling of that. Bitmaps allocated through a [`BitmapLedger`] are counted
//! so pipelines and tests can verify that every buffer was released.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reelout_common::{DeliveryError, DeliveryResult};

use crate::color::ColorSpace;

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Resolution multiplied by `factor`, rounded to whole pixels.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            width: (self.width as f64 * factor).round() as u32,
            height: (self.height as f64 * factor).round() as u32,
        }
    }

    pub fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Channels stored per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLayout {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

impl ChannelLayout {
    pub fn channel_count(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::GrayAlpha => 2,
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }

    pub fn alpha_index(self) -> Option<usize> {
        match self {
            Self::GrayAlpha => Some(1),
            Self::Rgba => Some(3),
            Self::Gray | Self::Rgb => None,
        }
    }

    pub fn has_alpha(self) -> bool {
        self.alpha_index().is_some()
    }
}

/// How alpha relates to the colour samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlphaMode {
    Opaque,
    Straight,
    Premultiplied,
}

/// Pixel format, colour space and alpha mode of a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Representation {
    pub layout: ChannelLayout,
    pub color_space: ColorSpace,
    pub alpha: AlphaMode,
}

impl Representation {
    pub const fn new(layout: ChannelLayout, color_space: ColorSpace, alpha: AlphaMode) -> Self {
        Self {
            layout,
            color_space,
            alpha,
        }
    }
}

/// Progressive or interlaced scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scan {
    Progressive,
    InterlacedTopFieldFirst,
    InterlacedBottomFieldFirst,
}

impl Scan {
    pub fn is_interlaced(self) -> bool {
        !matches!(self, Self::Progressive)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Progressive => "Progressive",
            Self::InterlacedTopFieldFirst => "Interlaced TFF",
            Self::InterlacedBottomFieldFirst => "Interlaced BFF",
        }
    }
}

impl fmt::Display for Scan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a bitmap holds one frame or two interleaved fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    ProgressiveFrame,
    InterleavedFields,
}

impl Content {
    pub fn for_scan(scan: Scan) -> Self {
        if scan.is_interlaced() {
            Self::InterleavedFields
        } else {
            Self::ProgressiveFrame
        }
    }
}

/// Everything needed to allocate or interpret a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitmapSpec {
    pub resolution: Resolution,
    pub representation: Representation,
    pub scan: Scan,
    pub content: Content,
}

impl BitmapSpec {
    pub fn new(resolution: Resolution, representation: Representation, scan: Scan) -> Self {
        Self {
            resolution,
            representation,
            scan,
            content: Content::for_scan(scan),
        }
    }

    /// Same geometry and scan with a different representation.
    pub fn with_representation(self, representation: Representation) -> Self {
        Self {
            representation,
            ..self
        }
    }
}

/// Pixel formats an encoder may be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Yuv420p,
    Yuv420p10,
    Yuv422p,
    Yuv422p10,
    Yuv444p10,
    Yuva444p10,
}

impl PixelFormat {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Yuv420p10 => "yuv420p10le",
            Self::Yuv422p => "yuv422p",
            Self::Yuv422p10 => "yuv422p10le",
            Self::Yuv444p10 => "yuv444p10le",
            Self::Yuva444p10 => "yuva444p10le",
        }
    }

    pub fn depth(self) -> u32 {
        match self {
            Self::Yuv420p | Self::Yuv422p => 8,
            _ => 10,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Self::Yuva444p10)
    }

    /// Chroma subsampling as log2 shifts `(horizontal, vertical)`.
    pub fn chroma_shift(self) -> (u32, u32) {
        match self {
            Self::Yuv420p | Self::Yuv420p10 => (1, 1),
            Self::Yuv422p | Self::Yuv422p10 => (1, 0),
            Self::Yuv444p10 | Self::Yuva444p10 => (0, 0),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

#[derive(Debug, Default)]
struct LedgerCounts {
    live: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// Counts bitmaps allocated through it that are still alive.
#[derive(Debug, Clone, Default)]
pub struct BitmapLedger {
    counts: Arc<LedgerCounts>,
}

impl BitmapLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed bitmap tracked by this ledger.
    pub fn allocate(&self, spec: BitmapSpec) -> Bitmap {
        let mut bitmap = Bitmap::allocate(spec);
        self.register();
        bitmap.ledger = Some(self.clone());
        bitmap
    }

    /// Bitmaps currently alive.
    pub fn live(&self) -> usize {
        self.counts.live.load(Ordering::SeqCst)
    }

    /// Highest number of bitmaps that were alive at the same time.
    pub fn peak(&self) -> usize {
        self.counts.peak.load(Ordering::SeqCst)
    }

    /// Bitmaps ever allocated.
    pub fn total(&self) -> usize {
        self.counts.total.load(Ordering::SeqCst)
    }

    fn register(&self) {
        let live = self.counts.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.peak.fetch_max(live, Ordering::SeqCst);
        self.counts.total.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.counts.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An owned frame buffer.
pub struct Bitmap {
    spec: BitmapSpec,
    planes: Vec<Vec<f32>>,
    ledger: Option<BitmapLedger>,
}

impl Bitmap {
    /// Allocate an untracked, zeroed bitmap.
    pub fn allocate(spec: BitmapSpec) -> Self {
        let pixels = spec.resolution.pixel_count();
        let planes = (0..spec.representation.layout.channel_count())
            .map(|_| vec![0.0; pixels])
            .collect();
        Self {
            spec,
            planes,
            ledger: None,
        }
    }

    /// Allocate a zeroed bitmap tracked by the same ledger as `self`.
    pub fn allocate_sibling(&self, spec: BitmapSpec) -> Self {
        match &self.ledger {
            Some(ledger) => ledger.allocate(spec),
            None => Self::allocate(spec),
        }
    }

    pub fn spec(&self) -> &BitmapSpec {
        &self.spec
    }

    pub fn width(&self) -> u32 {
        self.spec.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.spec.resolution.height
    }

    pub fn layout(&self) -> ChannelLayout {
        self.spec.representation.layout
    }

    pub fn plane(&self, channel: usize) -> &[f32] {
        &self.planes[channel]
    }

    pub fn plane_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.planes[channel]
    }

    /// Sample at `(x, y)` of one channel.
    pub fn sample(&self, channel: usize, x: u32, y: u32) -> f32 {
        self.planes[channel][y as usize * self.width() as usize + x as usize]
    }

    /// Set every sample of every channel to zero.
    pub fn zero(&mut self) -> &mut Self {
        for plane in &mut self.planes {
            plane.fill(0.0);
        }
        self
    }

    /// Copy all channels of `src`, which must share resolution and layout.
    pub fn blit(&mut self, src: &Bitmap) -> DeliveryResult<()> {
        if src.spec.resolution != self.spec.resolution || src.layout() != self.layout() {
            return Err(DeliveryError::source(format!(
                "cannot blit {} {:?} onto {} {:?}",
                src.spec.resolution,
                src.layout(),
                self.spec.resolution,
                self.layout()
            )));
        }
        for (dst, src) in self.planes.iter_mut().zip(&src.planes) {
            dst.copy_from_slice(src);
        }
        Ok(())
    }

    /// Copy one channel of `src` into one channel of `self`.
    pub fn blit_component(
        &mut self,
        src: &Bitmap,
        src_channel: usize,
        dst_channel: usize,
    ) -> DeliveryResult<()> {
        if src.spec.resolution != self.spec.resolution {
            return Err(DeliveryError::source(format!(
                "cannot blit component of {} onto {}",
                src.spec.resolution, self.spec.resolution
            )));
        }
        if src_channel >= src.planes.len() || dst_channel >= self.planes.len() {
            return Err(DeliveryError::source(format!(
                "channel out of range: {src_channel} of {:?} into {dst_channel} of {:?}",
                src.layout(),
                self.layout()
            )));
        }
        self.planes[dst_channel].copy_from_slice(&src.planes[src_channel]);
        Ok(())
    }

    /// Turn this bitmap into a gray bitmap holding only its alpha plane.
    ///
    /// The alpha storage is moved, not copied.
    pub fn alpha_plane_view(mut self) -> DeliveryResult<Bitmap> {
        let Some(alpha) = self.layout().alpha_index() else {
            return Err(DeliveryError::source(format!(
                "bitmap layout {:?} has no alpha plane",
                self.layout()
            )));
        };
        let plane = std::mem::take(&mut self.planes[alpha]);
        let spec = self.spec.with_representation(Representation::new(
            ChannelLayout::Gray,
            ColorSpace::BLENDING,
            AlphaMode::Opaque,
        ));
        Ok(Bitmap {
            spec,
            planes: vec![plane],
            ledger: self.ledger.take(),
        })
    }

    /// Release the storage now.
    pub fn close(self) {}
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.release();
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("spec", &self.spec)
            .field("tracked", &self.ledger.is_some())
            .finish()
    }
}
