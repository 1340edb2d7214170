//! Synthetic video for smoke renders and tests.

use std::sync::Arc;

use reelout_common::{DeliveryResult, Fps};
use reelout_render_model::{
    AlphaMode, Bitmap, BitmapLedger, BitmapRequest, BitmapSource, ChannelLayout, DeferredVideo,
    Resolution, TapeSpan,
};

/// Bar colours left to right. The last bar is brighter than diffuse white.
const BARS: [[f32; 3]; 8] = [
    [0.75, 0.75, 0.75],
    [0.75, 0.75, 0.0],
    [0.0, 0.75, 0.75],
    [0.0, 0.75, 0.0],
    [0.75, 0.0, 0.75],
    [0.75, 0.0, 0.0],
    [0.0, 0.0, 0.75],
    [1.5, 1.5, 1.5],
];

/// Colour bars under an alpha wipe that sweeps left to right over the video.
#[derive(Clone)]
pub struct TestPattern {
    resolution: Resolution,
    fps: Fps,
    num_frames: u64,
    /// Output frames per pattern frame.
    repeat: u64,
    tape_spans: Vec<TapeSpan>,
    ledger: Option<BitmapLedger>,
}

impl TestPattern {
    pub fn new(resolution: Resolution, fps: Fps, num_frames: u64) -> Self {
        Self {
            resolution,
            fps,
            num_frames,
            repeat: 1,
            tape_spans: Vec::new(),
            ledger: None,
        }
    }

    pub fn with_tape_spans(mut self, spans: Vec<TapeSpan>) -> Self {
        self.tape_spans = spans;
        self
    }

    /// Allocate every frame through `ledger`.
    pub fn with_ledger(mut self, ledger: BitmapLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    fn pixel(&self, x: u32, y: u32, frame: u64) -> ([f32; 3], f32) {
        let bar = (x as usize * BARS.len()) / self.resolution.width.max(1) as usize;
        let color = BARS[bar.min(BARS.len() - 1)];
        let pattern_frames = (self.num_frames / self.repeat).max(1);
        let edge = (frame + 1) as f64 / pattern_frames as f64 * self.resolution.width as f64;
        // The bottom row stays opaque so every frame has some coverage.
        let alpha = if (x as f64) < edge || y + 1 == self.resolution.height {
            1.0
        } else {
            0.0
        };
        (color, alpha)
    }
}

impl DeferredVideo for TestPattern {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn fps(&self) -> Fps {
        self.fps
    }

    fn num_frames(&self) -> u64 {
        self.num_frames
    }

    fn rescaled(&self, resolution_scaling: f64, fps_scaling: u32) -> Arc<dyn DeferredVideo> {
        let factor = u64::from(fps_scaling.max(1));
        let tape_spans = self
            .tape_spans
            .iter()
            .map(|span| TapeSpan {
                first_frame_idx: span.first_frame_idx * factor,
                last_frame_idx: (span.last_frame_idx + 1) * factor - 1,
                ..span.clone()
            })
            .collect();
        Arc::new(Self {
            resolution: self.resolution.scaled(resolution_scaling),
            fps: self.fps.scaled(fps_scaling.max(1)),
            num_frames: self.num_frames * factor,
            repeat: self.repeat * factor,
            tape_spans,
            ledger: self.ledger.clone(),
        })
    }

    fn bitmap_source(&self, request: &BitmapRequest) -> DeliveryResult<Box<dyn BitmapSource>> {
        Ok(Box::new(PatternSource {
            pattern: self.clone(),
            request: *request,
        }))
    }

    fn tape_spans(&self) -> Vec<TapeSpan> {
        self.tape_spans.clone()
    }
}

struct PatternSource {
    pattern: TestPattern,
    request: BitmapRequest,
}

impl PatternSource {
    fn allocate(&self) -> Bitmap {
        let mut spec = self.request.spec;
        spec.resolution = self.pattern.resolution;
        match &self.pattern.ledger {
            Some(ledger) => ledger.allocate(spec),
            None => Bitmap::allocate(spec),
        }
    }
}

impl BitmapSource for PatternSource {
    fn materialize_frame(&mut self, index: u64) -> DeliveryResult<Option<Bitmap>> {
        if index >= self.pattern.num_frames {
            return Ok(None);
        }
        let frame = index / self.pattern.repeat;
        let mut bitmap = self.allocate();
        let representation = self.request.spec.representation;
        let layout = representation.layout;
        let premultiply = representation.alpha == AlphaMode::Premultiplied;
        let ceiling = self.request.ceiling.unwrap_or(f32::INFINITY);
        let width = bitmap.width();

        for y in 0..bitmap.height() {
            for x in 0..width {
                let (mut rgb, alpha) = self.pattern.pixel(x, y, frame);
                if premultiply {
                    rgb = rgb.map(|c| c * alpha);
                }
                if let (Some(ground), false) = (self.request.grounding, layout.has_alpha()) {
                    for (c, g) in rgb.iter_mut().zip(ground) {
                        *c = *c * alpha + g * (1.0 - alpha);
                    }
                }
                let rgb = rgb.map(|c| c.min(ceiling));
                let offset = (y * width + x) as usize;
                match layout {
                    ChannelLayout::Gray | ChannelLayout::GrayAlpha => {
                        let luma = 0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2];
                        bitmap.plane_mut(0)[offset] = luma;
                    }
                    ChannelLayout::Rgb | ChannelLayout::Rgba => {
                        for (channel, value) in rgb.into_iter().enumerate() {
                            bitmap.plane_mut(channel)[offset] = value;
                        }
                    }
                }
                if let Some(alpha_idx) = layout.alpha_index() {
                    bitmap.plane_mut(alpha_idx)[offset] = alpha;
                }
            }
        }
        Ok(Some(bitmap))
    }
}
