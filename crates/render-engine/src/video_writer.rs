//! Encoder/muxer session wrapper with an explicit open/close lifecycle.
//!
//! A [`VideoWriter`] is opened against one ranked [`EncoderSetting`]. Setup runs
//! through the steps of [`EncoderSetupStep`]; if any step fails, everything
//! acquired so far is released and the error names the codec and the step.
//! Once open, frames get strictly increasing timestamps. `close()` flushes the
//! encoder and writes the trailer; dropping an unclosed writer only releases.

use std::path::{Path, PathBuf};

use reelout_common::{DeliveryError, DeliveryResult, EncoderSetupStep, Fps};
use reelout_render_model::{Bitmap, PixelFormat, Primaries, Representation, Resolution, Scan, Transfer};

/// One concrete encoder configuration a format may try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSetting {
    pub codec_name: String,
    pub profile: Option<String>,
    /// Private codec options, applied in order.
    pub options: Vec<(String, String)>,
    pub pixel_format: PixelFormat,
}

impl EncoderSetting {
    pub fn new(codec_name: impl Into<String>, pixel_format: PixelFormat) -> Self {
        Self {
            codec_name: codec_name.into(),
            profile: None,
            options: Vec::new(),
            pixel_format,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }
}

/// Colour metadata written into the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorTags {
    pub primaries: Primaries,
    pub transfer: Transfer,
    /// YUV matrix name, e.g. `bt709`.
    pub matrix: &'static str,
    pub full_range: bool,
}

/// Stream-level parameters shared by every encoder setting of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParams {
    pub resolution: Resolution,
    /// Full frames per second, also for interlaced scan.
    pub fps: Fps,
    pub scan: Scan,
    /// Representation of the bitmaps handed to [`VideoWriter::write`].
    pub input: Representation,
    pub color: ColorTags,
    /// Container metadata entries.
    pub metadata: Vec<(String, String)>,
}

/// Factory for encoder sessions.
pub trait MuxBackend: Send + Sync {
    fn name(&self) -> &str;

    fn create_session(&self) -> DeliveryResult<Box<dyn MuxSession>>;
}

/// One encoder plus muxer, driven step by step by a [`VideoWriter`].
///
/// `release` must be safe to call in any state and more than once.
pub trait MuxSession: Send {
    fn add_stream(&mut self, params: &StreamParams) -> DeliveryResult<()>;
    fn open_codec(&mut self, setting: &EncoderSetting) -> DeliveryResult<()>;
    fn alloc_frame_buffers(&mut self) -> DeliveryResult<()>;
    fn open_io(&mut self, path: &Path) -> DeliveryResult<()>;
    fn write_header(&mut self) -> DeliveryResult<()>;

    /// Send one frame, or `None` to signal end of stream.
    fn send_frame(&mut self, frame: Option<(&Bitmap, i64)>) -> DeliveryResult<()>;

    /// Move all pending packets to the muxer. Returns how many were written.
    fn receive_packets(&mut self) -> DeliveryResult<usize>;

    fn write_trailer(&mut self) -> DeliveryResult<()>;

    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Constructing,
    Open,
    Closing,
    Closed,
}

pub struct VideoWriter {
    session: Box<dyn MuxSession>,
    state: WriterState,
    codec_name: String,
    path: PathBuf,
    resolution: Resolution,
    input: Representation,
    frame_counter: u64,
}

impl VideoWriter {
    /// Run every setup step, rolling back on the first failure.
    pub fn open(
        backend: &dyn MuxBackend,
        path: &Path,
        params: &StreamParams,
        setting: &EncoderSetting,
    ) -> DeliveryResult<Self> {
        if params.scan.is_interlaced() && setting.pixel_format.chroma_shift().1 != 0 {
            return Err(DeliveryError::configuration(format!(
                "interlaced scan cannot be combined with vertically subsampled {}",
                setting.pixel_format
            )));
        }

        let codec = setting.codec_name.as_str();
        let session = backend
            .create_session()
            .map_err(|e| open_error(codec, EncoderSetupStep::Stream, e))?;

        // From here on, dropping `writer` on an early return releases the session.
        let mut writer = Self {
            session,
            state: WriterState::Constructing,
            codec_name: setting.codec_name.clone(),
            path: path.to_path_buf(),
            resolution: params.resolution,
            input: params.input,
            frame_counter: 0,
        };

        writer
            .session
            .add_stream(params)
            .map_err(|e| open_error(codec, EncoderSetupStep::Stream, e))?;
        writer
            .session
            .open_codec(setting)
            .map_err(|e| open_error(codec, EncoderSetupStep::CodecContext, e))?;
        writer
            .session
            .alloc_frame_buffers()
            .map_err(|e| open_error(codec, EncoderSetupStep::FrameBuffers, e))?;
        writer
            .session
            .open_io(path)
            .map_err(|e| open_error(codec, EncoderSetupStep::MuxerIo, e))?;
        writer
            .session
            .write_header()
            .map_err(|e| open_error(codec, EncoderSetupStep::Header, e))?;

        writer.state = WriterState::Open;
        tracing::debug!(
            codec = %writer.codec_name,
            backend = backend.name(),
            path = %path.display(),
            resolution = %params.resolution,
            "Video writer opened"
        );
        Ok(writer)
    }

    /// Encode one frame. Its timestamp is the number of frames written before it.
    pub fn write(&mut self, bitmap: &Bitmap) -> DeliveryResult<()> {
        if self.state != WriterState::Open {
            return Err(DeliveryError::encoder_stream(format!(
                "cannot write to a video writer in state {:?}",
                self.state
            )));
        }
        let spec = bitmap.spec();
        if spec.resolution != self.resolution || spec.representation.layout != self.input.layout {
            return Err(DeliveryError::encoder_stream(format!(
                "frame {} {:?} does not match stream {} {:?}",
                spec.resolution, spec.representation.layout, self.resolution, self.input.layout
            )));
        }

        let pts = self.frame_counter as i64;
        self.session
            .send_frame(Some((bitmap, pts)))
            .map_err(stream_error)?;
        self.session.receive_packets().map_err(stream_error)?;
        self.frame_counter += 1;
        Ok(())
    }

    /// Frames successfully written so far.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the encoder, write the trailer and release. Releases even on error.
    pub fn close(mut self) -> DeliveryResult<()> {
        self.state = WriterState::Closing;
        let result = self.finish();
        self.session.release();
        self.state = WriterState::Closed;
        tracing::debug!(
            codec = %self.codec_name,
            frames = self.frame_counter,
            ok = result.is_ok(),
            "Video writer closed"
        );
        result
    }

    fn finish(&mut self) -> DeliveryResult<()> {
        self.session.send_frame(None).map_err(stream_error)?;
        self.session.receive_packets().map_err(stream_error)?;
        self.session.write_trailer().map_err(stream_error)
    }
}

impl Drop for VideoWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            self.session.release();
            self.state = WriterState::Closed;
        }
    }
}

fn open_error(codec: &str, step: EncoderSetupStep, err: DeliveryError) -> DeliveryError {
    match err {
        err @ DeliveryError::EncoderOpen { .. } => err,
        other => DeliveryError::encoder_open(codec, step, other.to_string()),
    }
}

fn stream_error(err: DeliveryError) -> DeliveryError {
    match err {
        err @ (DeliveryError::EncoderStream { .. } | DeliveryError::Io(_)) => err,
        other => DeliveryError::encoder_stream(other.to_string()),
    }
}
