//! Single-file video export through a [`VideoWriter`].
//!
//! One helper thread materializes frames into a bounded channel while the
//! calling thread encodes them in strict index order.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError};
use serde::Serialize;

use reelout_common::{
    CancelFlag, ChildCancelFlag, DeliveryError, DeliveryResult, CANCEL_POLL_INTERVAL,
};
use reelout_render_model::{
    AlphaMode, Bitmap, BitmapRequest, BitmapSource, BitmapSpec, ChannelLayout, Channels,
    ColorSpace, Config, DnxhrProfile, PixelFormat, Primaries, Representation,
    Transfer, CHANNELS, COLOR_PRESET, DEPTH, DNXHR_PROFILE, FPS_SCALING, PRORES_PROFILE,
    RESOLUTION_SCALING_LOG2, SCAN,
};

use crate::job::{MonotonicProgress, ProgressFn, RenderInputs, RenderJob, RenderTuning};
use crate::video_writer::{ColorTags, EncoderSetting, MuxBackend, StreamParams, VideoWriter};

type FrameResult = DeliveryResult<(u64, Bitmap)>;

/// Codec family of a container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerCodec {
    H264,
    H265,
    ProRes,
    Dnxhr,
}

impl ContainerCodec {
    /// Encoder settings in the order they should be tried.
    pub fn encoder_settings(self, config: &Config, prefer_hardware: bool) -> Vec<EncoderSetting> {
        let hardware = prefer_hardware && cfg!(target_os = "macos");
        let depth = config.get_or_default(&DEPTH);
        let channels = config.get_or_default(&CHANNELS);

        let (codecs, profile, pixel_format): (Vec<&str>, Option<&str>, PixelFormat) = match self {
            Self::H264 | Self::H265 => {
                let (software, videotoolbox, profile8, profile10) = if self == Self::H264 {
                    ("libx264", "h264_videotoolbox", "high", "high10")
                } else {
                    ("libx265", "hevc_videotoolbox", "main", "main10")
                };
                let codecs = if hardware {
                    vec![videotoolbox, software]
                } else {
                    vec![software]
                };
                if depth == 8 {
                    (codecs, Some(profile8), PixelFormat::Yuv420p)
                } else {
                    (codecs, Some(profile10), PixelFormat::Yuv420p10)
                }
            }
            Self::ProRes => {
                let profile = config.get_or_default(&PRORES_PROFILE);
                let embed_alpha = channels == Channels::ColorAndAlpha;
                // Only prores_ks writes 4444 alpha that other tools read reliably.
                let software = if !profile.is_422() && embed_alpha {
                    "prores_ks"
                } else {
                    "prores_aw"
                };
                let codecs = if hardware {
                    vec!["prores_videotoolbox", software]
                } else {
                    vec![software]
                };
                let pixel_format = if profile.is_422() {
                    PixelFormat::Yuv422p10
                } else if embed_alpha {
                    PixelFormat::Yuva444p10
                } else {
                    PixelFormat::Yuv444p10
                };
                (codecs, Some(profile.ffmpeg_profile()), pixel_format)
            }
            Self::Dnxhr => {
                let profile = config.get_or_default(&DNXHR_PROFILE);
                let pixel_format = match profile {
                    DnxhrProfile::Hqx => PixelFormat::Yuv422p10,
                    DnxhrProfile::Dnx444 => PixelFormat::Yuv444p10,
                    DnxhrProfile::Lb | DnxhrProfile::Sq | DnxhrProfile::Hq => PixelFormat::Yuv422p,
                };
                return vec![EncoderSetting::new("dnxhd", pixel_format)
                    .with_option("profile", profile.ffmpeg_profile())];
            }
        };

        codecs
            .into_iter()
            .map(|codec| {
                let setting = EncoderSetting::new(codec, pixel_format);
                match profile {
                    Some(profile) => setting.with_profile(profile),
                    None => setting,
                }
            })
            .collect()
    }
}

/// Open the first setting that works. Only open failures fall through to the
/// next setting; the last open failure is returned when all of them fail.
pub fn open_first_working(
    backend: &dyn MuxBackend,
    path: &Path,
    params: &StreamParams,
    settings: &[EncoderSetting],
) -> DeliveryResult<VideoWriter> {
    let mut last_error = None;
    for (i, setting) in settings.iter().enumerate() {
        match VideoWriter::open(backend, path, params, setting) {
            Ok(writer) => return Ok(writer),
            Err(e) if e.is_encoder_open_failure() => {
                if i + 1 < settings.len() {
                    tracing::warn!(
                        codec = %setting.codec_name,
                        error = %e,
                        "Falling back to next encoder"
                    );
                }
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| DeliveryError::configuration("no encoder settings to try")))
}

/// Helper thread producing frames `0..num_frames` in order.
///
/// Dropping it stops the thread, waits a bounded time for it to exit, and
/// closes every frame still queued.
struct Materializer {
    handle: Option<JoinHandle<()>>,
    receiver: Receiver<FrameResult>,
    stop: ChildCancelFlag,
    join_timeout: Duration,
}

impl Materializer {
    fn start(
        mut source: Box<dyn BitmapSource>,
        num_frames: u64,
        capacity: usize,
        cancel: &CancelFlag,
        join_timeout: Duration,
    ) -> DeliveryResult<Self> {
        let (sender, receiver) = bounded::<FrameResult>(capacity.max(1));
        let stop = cancel.child();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("frame-materializer".to_string())
            .spawn(move || {
                for idx in 0..num_frames {
                    if thread_stop.is_cancelled() {
                        break;
                    }
                    let (mut item, last) = match source.materialize_frame(idx) {
                        Ok(Some(bitmap)) => (Ok((idx, bitmap)), false),
                        Ok(None) => (
                            Err(DeliveryError::source(format!(
                                "video ended at frame {idx} of {num_frames}"
                            ))),
                            true,
                        ),
                        Err(e) => (Err(e), true),
                    };
                    loop {
                        match sender.send_timeout(item, CANCEL_POLL_INTERVAL) {
                            Ok(()) => break,
                            Err(SendTimeoutError::Timeout(back)) => {
                                if thread_stop.is_cancelled() {
                                    return;
                                }
                                item = back;
                            }
                            Err(SendTimeoutError::Disconnected(_)) => return,
                        }
                    }
                    if last {
                        break;
                    }
                    if idx + 1 < num_frames {
                        source.preload_frame(idx + 1);
                    }
                }
            })?;
        Ok(Self {
            handle: Some(handle),
            receiver,
            stop,
            join_timeout,
        })
    }

    fn next(&self, cancel: &CancelFlag) -> FrameResult {
        loop {
            cancel.check()?;
            match self.receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(item) => return item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    cancel.check()?;
                    return Err(DeliveryError::encoder_stream(
                        "frame materializer stopped before the last frame",
                    ));
                }
            }
        }
    }

    fn drain(&self) {
        while let Ok(item) = self.receiver.try_recv() {
            if let Ok((_, bitmap)) = item {
                bitmap.close();
            }
        }
    }
}

impl Drop for Materializer {
    fn drop(&mut self) {
        self.stop.cancel();
        let deadline = Instant::now() + self.join_timeout;
        loop {
            self.drain();
            match &self.handle {
                Some(handle) if !handle.is_finished() && Instant::now() < deadline => {
                    std::thread::sleep(CANCEL_POLL_INTERVAL);
                }
                _ => break,
            }
        }
        self.drain();
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::warn!("Frame materializer thread panicked");
                }
            } else {
                tracing::warn!(
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Frame materializer did not stop in time"
                );
            }
        }
    }
}

/// Channels and representations of one container export.
#[derive(Debug, Clone, Copy)]
pub struct ContainerFrames {
    pub num_frames: u64,
    /// Spec of the frames the writer receives.
    pub writer_spec: BitmapSpec,
    /// Composite the source's alpha plane onto a gray frame before writing.
    pub matte: bool,
}

/// Encode every frame of `source` into `path`.
#[allow(clippy::too_many_arguments)]
pub fn write_video_container(
    source: Box<dyn BitmapSource>,
    frames: &ContainerFrames,
    backend: &dyn MuxBackend,
    path: &Path,
    params: &StreamParams,
    settings: &[EncoderSetting],
    tuning: &RenderTuning,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> DeliveryResult<()> {
    cancel.check()?;
    let mut writer = open_first_working(backend, path, params, settings)?;
    tracing::debug!(codec = writer.codec_name(), frames = frames.num_frames, "Encoding video");

    let materializer = Materializer::start(
        source,
        frames.num_frames,
        tuning.container_queue_capacity,
        cancel,
        tuning.materializer_join_timeout,
    )?;
    let reporter = MonotonicProgress::new(progress, frames.num_frames);

    for expected in 0..frames.num_frames {
        let (idx, bitmap) = materializer.next(cancel)?;
        if idx != expected {
            bitmap.close();
            return Err(DeliveryError::encoder_stream(format!(
                "expected frame {expected} but received frame {idx}"
            )));
        }
        if frames.matte {
            let mut matte = bitmap.allocate_sibling(frames.writer_spec);
            matte.zero().blit_component(&bitmap, 3, 0)?;
            bitmap.close();
            writer.write(&matte)?;
            matte.close();
        } else {
            writer.write(&bitmap)?;
            bitmap.close();
        }
        reporter.report(expected + 1);
        cancel.check()?;
    }

    drop(materializer);
    writer.close()?;
    reporter.report(frames.num_frames);
    Ok(())
}

/// Renders a video into one H.264, H.265, ProRes or DNxHR file.
pub struct VideoContainerRenderJob {
    codec: ContainerCodec,
    config: Config,
    inputs: RenderInputs,
}

impl VideoContainerRenderJob {
    pub(crate) fn new(codec: ContainerCodec, config: Config, inputs: RenderInputs) -> Self {
        Self {
            codec,
            config,
            inputs,
        }
    }
}

impl RenderJob for VideoContainerRenderJob {
    fn destination(&self) -> &Path {
        &self.inputs.destination
    }

    fn render(&self, progress: &ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()> {
        let path = &self.inputs.destination;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let config = &self.config;
        let channels = config.get_or_default(&CHANNELS);
        let matte = channels == Channels::Alpha;
        let preset = config.get_or_default(&COLOR_PRESET);
        let scan = config.get_or_default(&SCAN);
        let settings = self
            .codec
            .encoder_settings(config, self.inputs.tuning.prefer_hardware_encoders);
        let video = self.inputs.video.rescaled(
            2f64.powi(config.get_or_default(&RESOLUTION_SCALING_LOG2)),
            config.get_or_default(&FPS_SCALING).max(1) as u32,
        );
        let resolution = video.resolution();

        let preset_space = ColorSpace::new(preset.primaries(), preset.transfer());
        let (source_rep, writer_rep, grounding) = match channels {
            Channels::Color => {
                let rep = Representation::new(ChannelLayout::Rgb, preset_space, AlphaMode::Opaque);
                (rep, rep, self.inputs.grounding)
            }
            Channels::ColorAndAlpha => {
                let rep = Representation::new(ChannelLayout::Rgba, preset_space, AlphaMode::Straight);
                (rep, rep, None)
            }
            Channels::Alpha => (
                Representation::new(ChannelLayout::Rgba, ColorSpace::BLENDING, AlphaMode::Premultiplied),
                Representation::new(ChannelLayout::Gray, ColorSpace::BLENDING, AlphaMode::Opaque),
                None,
            ),
        };
        let color = if matte {
            ColorTags {
                primaries: Primaries::Bt709,
                transfer: Transfer::Linear,
                matrix: "bt709",
                full_range: true,
            }
        } else {
            ColorTags {
                primaries: preset.primaries(),
                transfer: preset.transfer(),
                matrix: preset.ffmpeg_matrix(),
                full_range: false,
            }
        };
        let params = StreamParams {
            resolution,
            fps: video.fps(),
            scan,
            input: writer_rep,
            color,
            metadata: Vec::new(),
        };
        let request = BitmapRequest {
            spec: BitmapSpec::new(resolution, source_rep, scan),
            grounding,
            ceiling: if preset.transfer().is_hdr() { None } else { Some(1.0) },
        };
        let frames = ContainerFrames {
            num_frames: video.num_frames(),
            writer_spec: BitmapSpec::new(resolution, writer_rep, scan),
            matte,
        };

        tracing::info!(
            codec = ?self.codec,
            config = %config,
            frames = frames.num_frames,
            path = %path.display(),
            "Video container render started"
        );
        let source = video.bitmap_source(&request)?;
        write_video_container(
            source,
            &frames,
            self.inputs.mux_backend.as_ref(),
            path,
            &params,
            &settings,
            &self.inputs.tuning,
            progress,
            cancel,
        )
    }
}
