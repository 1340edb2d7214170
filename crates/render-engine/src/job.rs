//! Render job contract and the inputs shared by every job kind.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reelout_common::{CancelFlag, DeliveryConfig, DeliveryError, DeliveryResult, TimecodeFormat};
use reelout_render_model::DeferredVideo;

use crate::ffmpeg::FfmpegMuxBackend;
use crate::video_writer::MuxBackend;

/// Upper end of the integer progress scale.
pub const MAX_RENDER_PROGRESS: u32 = 10_000;

/// Progress callback; receives values in `0..=MAX_RENDER_PROGRESS`.
pub type ProgressFn = dyn Fn(u32) + Send + Sync;

/// A unit of export work, run at most once.
pub trait RenderJob: Send + Sync {
    /// Output file, or output directory for file sequences.
    fn destination(&self) -> &Path;

    /// Render everything, reporting non-decreasing progress that ends at
    /// [`MAX_RENDER_PROGRESS`] on success.
    ///
    /// Returns `Err(Cancelled)` once `cancel` is raised.
    fn render(&self, progress: &ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()>;
}

/// Pipeline sizing handed to jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTuning {
    pub pool_size: usize,
    pub backlog_factor: usize,
    pub container_queue_capacity: usize,
    pub materializer_join_timeout: Duration,
    pub pool_grace_period: Duration,
    pub prefer_hardware_encoders: bool,
}

impl RenderTuning {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            pool_size: config.render.pool_size(),
            backlog_factor: config.render.backlog_factor.max(1),
            container_queue_capacity: config.render.container_queue_capacity.max(1),
            materializer_join_timeout: Duration::from_millis(
                config.render.materializer_join_timeout_ms,
            ),
            pool_grace_period: Duration::from_millis(config.render.pool_grace_period_ms),
            prefer_hardware_encoders: config.encoder.prefer_hardware_encoders,
        }
    }
}

impl Default for RenderTuning {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

/// Everything a format needs besides the config to build a job.
#[derive(Clone)]
pub struct RenderInputs {
    pub video: Arc<dyn DeferredVideo>,
    /// Output file, or output directory for file sequences.
    pub destination: PathBuf,
    /// `%0Nd` style file name pattern for sequences, applied to 1-based frame numbers.
    pub filename_pattern: Option<String>,
    /// Background drawn under opaque exports.
    pub grounding: Option<[f32; 3]>,
    /// Record timecode format used by tabular timelines.
    pub timecode_format: TimecodeFormat,
    pub tuning: RenderTuning,
    pub mux_backend: Arc<dyn MuxBackend>,
}

impl RenderInputs {
    pub fn new(video: Arc<dyn DeferredVideo>, destination: impl Into<PathBuf>) -> Self {
        Self {
            video,
            destination: destination.into(),
            filename_pattern: None,
            grounding: None,
            timecode_format: TimecodeFormat::default(),
            tuning: RenderTuning::default(),
            mux_backend: Arc::new(FfmpegMuxBackend::default()),
        }
    }

    pub fn with_filename_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = Some(pattern.into());
        self
    }

    pub fn with_grounding(mut self, rgb: [f32; 3]) -> Self {
        self.grounding = Some(rgb);
        self
    }

    pub fn with_timecode_format(mut self, format: TimecodeFormat) -> Self {
        self.timecode_format = format;
        self
    }

    pub fn with_tuning(mut self, tuning: RenderTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_mux_backend(mut self, backend: Arc<dyn MuxBackend>) -> Self {
        self.mux_backend = backend;
        self
    }
}

/// Reports `done / total` on the progress scale, never going backwards even
/// when several threads report concurrently.
pub(crate) struct MonotonicProgress<'a> {
    callback: &'a ProgressFn,
    total: u64,
    last: Mutex<u32>,
}

impl<'a> MonotonicProgress<'a> {
    pub(crate) fn new(callback: &'a ProgressFn, total: u64) -> Self {
        Self {
            callback,
            total,
            last: Mutex::new(0),
        }
    }

    pub(crate) fn report(&self, done: u64) {
        let value = if self.total == 0 {
            MAX_RENDER_PROGRESS
        } else {
            (MAX_RENDER_PROGRESS as u64 * done.min(self.total) / self.total) as u32
        };
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if value > *last {
            *last = value;
            (self.callback)(value);
        }
    }
}

/// Apply a `%d` / `%0Nd` pattern to a frame number. `%%` is a literal percent sign.
pub fn format_frame_filename(pattern: &str, frame_number: u64) -> DeliveryResult<String> {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut placeholders = 0;
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut zero_pad = false;
        let mut width = String::new();
        while let Some(&d) = chars.peek() {
            if d == '0' && width.is_empty() && !zero_pad {
                zero_pad = true;
                chars.next();
            } else if d.is_ascii_digit() {
                width.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if chars.next() != Some('d') {
            return Err(DeliveryError::configuration(format!(
                "filename pattern '{pattern}' has an unsupported placeholder"
            )));
        }
        let width: usize = width.parse().unwrap_or(0);
        if zero_pad {
            out.push_str(&format!("{frame_number:0width$}"));
        } else {
            out.push_str(&format!("{frame_number:width$}"));
        }
        placeholders += 1;
    }
    if placeholders == 0 {
        return Err(DeliveryError::configuration(format!(
            "filename pattern '{pattern}' has no frame number placeholder"
        )));
    }
    Ok(out)
}
