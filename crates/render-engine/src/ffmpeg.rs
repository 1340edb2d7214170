//! Mux backend that pipes raw frames into an `ffmpeg` subprocess.
//!
//! Frames are sent as interleaved 16-bit little-endian samples; ffmpeg does
//! the colour conversion into the encoder's pixel format and muxes the file.

use std::collections::HashSet;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::OnceLock;
use std::thread::JoinHandle;

use reelout_common::{DeliveryConfig, DeliveryError, DeliveryResult};
use reelout_render_model::{Bitmap, ChannelLayout, Scan};

use crate::video_writer::{EncoderSetting, MuxBackend, MuxSession, StreamParams};

pub struct FfmpegMuxBackend {
    ffmpeg_path: PathBuf,
    encoders: OnceLock<Result<HashSet<String>, String>>,
}

impl FfmpegMuxBackend {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            encoders: OnceLock::new(),
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(&config.encoder.ffmpeg_path)
    }

    /// Whether the ffmpeg binary can be run at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// Names of the video encoders this ffmpeg build offers. Listed once.
    pub fn encoders(&self) -> DeliveryResult<&HashSet<String>> {
        self.encoders
            .get_or_init(|| list_encoders(&self.ffmpeg_path))
            .as_ref()
            .map_err(|e| DeliveryError::unsupported(e.clone()))
    }
}

impl Default for FfmpegMuxBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl MuxBackend for FfmpegMuxBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn create_session(&self) -> DeliveryResult<Box<dyn MuxSession>> {
        Ok(Box::new(FfmpegSession {
            backend_path: self.ffmpeg_path.clone(),
            encoders: self.encoders().map(|e| e.clone()),
            params: None,
            setting: None,
            scratch: Vec::new(),
            process: None,
        }))
    }
}

fn list_encoders(ffmpeg: &Path) -> Result<HashSet<String>, String> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .map_err(|e| format!("Failed to run {}: {e}", ffmpeg.display()))?;
    if !output.status.success() {
        return Err(format!(
            "{} -encoders failed (status {})",
            ffmpeg.display(),
            output.status
        ));
    }
    let encoders = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(count = encoders.len(), "Listed ffmpeg video encoders");
    Ok(encoders)
}

/// Extract video encoder names from `ffmpeg -encoders` output.
fn parse_encoder_list(text: &str) -> HashSet<String> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let flags = tokens.next()?;
            let name = tokens.next()?;
            let is_flags = flags.len() == 6
                && flags.starts_with('V')
                && flags.chars().all(|c| "VASFXBD.".contains(c));
            (is_flags && name != "=").then(|| name.to_string())
        })
        .collect()
}

fn raw_input_format(layout: ChannelLayout) -> &'static str {
    match layout {
        ChannelLayout::Gray => "gray16le",
        ChannelLayout::GrayAlpha => "ya16le",
        ChannelLayout::Rgb => "rgb48le",
        ChannelLayout::Rgba => "rgba64le",
    }
}

/// Encoder, colour tag and field order arguments shared by real and trial runs.
fn encoder_args(params: &StreamParams, setting: &EncoderSetting) -> Vec<String> {
    let range = if params.color.full_range { "pc" } else { "tv" };
    let mut args: Vec<String> = vec!["-c:v".into(), setting.codec_name.clone()];
    if let Some(profile) = &setting.profile {
        args.extend(["-profile:v".into(), profile.clone()]);
    }
    for (key, value) in &setting.options {
        args.extend([format!("-{key}"), value.clone()]);
    }
    args.extend([
        "-pix_fmt".into(),
        setting.pixel_format.ffmpeg_name().into(),
        "-color_primaries".into(),
        params.color.primaries.ffmpeg_name().into(),
        "-color_trc".into(),
        params.color.transfer.ffmpeg_name().into(),
        "-colorspace".into(),
        params.color.matrix.into(),
        "-color_range".into(),
        range.into(),
    ]);
    match params.scan {
        Scan::Progressive => {}
        Scan::InterlacedTopFieldFirst | Scan::InterlacedBottomFieldFirst => {
            let order = if params.scan == Scan::InterlacedTopFieldFirst {
                "tt"
            } else {
                "bb"
            };
            args.extend([
                "-field_order".into(),
                order.into(),
                "-flags".into(),
                "+ildct+ilme".into(),
            ]);
        }
    }
    args
}

/// Full ffmpeg argument list for one output file.
pub(crate) fn command_args(
    params: &StreamParams,
    setting: &EncoderSetting,
    path: &Path,
    creation_time: &str,
) -> Vec<String> {
    let range = if params.color.full_range { "pc" } else { "tv" };
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        raw_input_format(params.input.layout).into(),
        "-s".into(),
        params.resolution.to_string(),
        "-r".into(),
        format!("{}/{}", params.fps.numerator, params.fps.denominator),
        "-i".into(),
        "-".into(),
        "-an".into(),
        "-vf".into(),
        format!(
            "scale=out_color_matrix={}:out_range={}",
            params.color.matrix, range
        ),
    ];
    args.extend(encoder_args(params, setting));
    args.extend([
        "-metadata".into(),
        format!("encoding_tool=Reelout {}", env!("CARGO_PKG_VERSION")),
        "-metadata".into(),
        format!("creation_time={creation_time}"),
    ]);
    for (key, value) in &params.metadata {
        args.extend(["-metadata".into(), format!("{key}={value}")]);
    }
    args.push(path.to_string_lossy().into_owned());
    args
}

/// Arguments that encode one black frame to the null muxer.
///
/// ffmpeg initializes the encoder only once input arrives, so a listed encoder
/// that cannot start is caught here rather than on the first frame.
pub(crate) fn trial_args(params: &StreamParams, setting: &EncoderSetting) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!(
            "color=c=black:s={}:r={}/{}",
            params.resolution, params.fps.numerator, params.fps.denominator
        ),
        "-frames:v".into(),
        "1".into(),
        "-an".into(),
    ];
    args.extend(encoder_args(params, setting));
    args.extend(["-f".into(), "null".into(), "-".into()]);
    args
}

struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_task: Option<JoinHandle<String>>,
}

impl FfmpegProcess {
    /// Wait for exit and collect stderr.
    fn wait(&mut self) -> DeliveryResult<(std::process::ExitStatus, String)> {
        self.stdin.take();
        let status = self
            .child
            .wait()
            .map_err(|e| DeliveryError::encoder_stream(format!("Failed to wait on ffmpeg: {e}")))?;
        Ok((status, self.join_stderr()))
    }

    fn join_stderr(&mut self) -> String {
        self.stderr_task
            .take()
            .map(|task| {
                task.join()
                    .unwrap_or_else(|_| "<failed to join stderr reader>".to_string())
            })
            .unwrap_or_default()
    }
}

struct FfmpegSession {
    backend_path: PathBuf,
    encoders: DeliveryResult<HashSet<String>>,
    params: Option<StreamParams>,
    setting: Option<EncoderSetting>,
    scratch: Vec<u8>,
    process: Option<FfmpegProcess>,
}

impl FfmpegSession {
    fn process(&mut self) -> DeliveryResult<&mut FfmpegProcess> {
        self.process
            .as_mut()
            .ok_or_else(|| DeliveryError::encoder_stream("ffmpeg process is not running"))
    }

    /// Error for a process that died early, with its stderr attached.
    fn exited_early(&mut self, context: &str) -> DeliveryError {
        let detail = match self.process.as_mut().map(FfmpegProcess::wait) {
            Some(Ok((status, stderr))) => format!("status {status}: {}", stderr.trim()),
            Some(Err(e)) => e.to_string(),
            None => "no process".to_string(),
        };
        DeliveryError::encoder_stream(format!("{context} ({detail})"))
    }

    fn pack(&mut self, bitmap: &Bitmap) {
        let channels = bitmap.layout().channel_count();
        let pixels = bitmap.spec().resolution.pixel_count();
        self.scratch.clear();
        self.scratch.reserve(pixels * channels * 2);
        for i in 0..pixels {
            for c in 0..channels {
                let value = (bitmap.plane(c)[i].clamp(0.0, 1.0) * 65535.0).round() as u16;
                self.scratch.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
}

impl MuxSession for FfmpegSession {
    fn add_stream(&mut self, params: &StreamParams) -> DeliveryResult<()> {
        if params.resolution.width == 0 || params.resolution.height == 0 {
            return Err(DeliveryError::unsupported(format!(
                "cannot encode an empty {} stream",
                params.resolution
            )));
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn open_codec(&mut self, setting: &EncoderSetting) -> DeliveryResult<()> {
        let encoders = self.encoders.as_ref().map_err(|e| DeliveryError::unsupported(e.to_string()))?;
        if !encoders.contains(&setting.codec_name) {
            return Err(DeliveryError::unsupported(format!(
                "encoder '{}' is not available in {}",
                setting.codec_name,
                self.backend_path.display()
            )));
        }
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| DeliveryError::unsupported("no stream was added"))?;
        let output = Command::new(&self.backend_path)
            .args(trial_args(params, setting))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| DeliveryError::unsupported(format!("Failed to start ffmpeg: {e}")))?;
        if !output.status.success() {
            return Err(DeliveryError::unsupported(format!(
                "encoder '{}' failed to initialize (status {}): {}",
                setting.codec_name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(codec = %setting.codec_name, "Trial encode succeeded");
        self.setting = Some(setting.clone());
        Ok(())
    }

    fn alloc_frame_buffers(&mut self) -> DeliveryResult<()> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| DeliveryError::unsupported("no stream was added"))?;
        let bytes = params.resolution.pixel_count() * params.input.layout.channel_count() * 2;
        self.scratch = Vec::with_capacity(bytes);
        Ok(())
    }

    fn open_io(&mut self, path: &Path) -> DeliveryResult<()> {
        let (Some(params), Some(setting)) = (&self.params, &self.setting) else {
            return Err(DeliveryError::unsupported("stream or codec is not configured"));
        };
        let creation_time = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let args = command_args(params, setting, path, &creation_time);
        tracing::debug!(args = ?args, "Running ffmpeg");

        let mut child = Command::new(&self.backend_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DeliveryError::unsupported(format!("Failed to start ffmpeg: {e}")))?;

        let stdin = child.stdin.take();
        let stderr_task = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || -> String {
                let mut reader = BufReader::new(stderr);
                let mut output = String::new();
                match reader.read_to_string(&mut output) {
                    Ok(_) => output,
                    Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
                }
            })
        });
        tracing::info!(pid = child.id(), codec = %setting.codec_name, "ffmpeg process started");

        self.process = Some(FfmpegProcess {
            child,
            stdin,
            stderr_task,
        });
        Ok(())
    }

    fn write_header(&mut self) -> DeliveryResult<()> {
        let exited = self
            .process()?
            .child
            .try_wait()
            .map_err(|e| DeliveryError::unsupported(format!("Failed to poll ffmpeg: {e}")))?;
        if exited.is_some() {
            let err = self.exited_early("ffmpeg exited before the first frame");
            return Err(DeliveryError::unsupported(err.to_string()));
        }
        Ok(())
    }

    fn send_frame(&mut self, frame: Option<(&Bitmap, i64)>) -> DeliveryResult<()> {
        let Some((bitmap, _pts)) = frame else {
            // Closing stdin is the end-of-stream signal.
            self.process()?.stdin.take();
            return Ok(());
        };
        self.pack(bitmap);
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| DeliveryError::encoder_stream("ffmpeg process is not running"))?;
        let Some(stdin) = process.stdin.as_mut() else {
            return Err(DeliveryError::encoder_stream("ffmpeg input is already closed"));
        };
        if let Err(e) = stdin.write_all(&self.scratch) {
            return Err(self.exited_early(&format!("Failed to send frame to ffmpeg: {e}")));
        }
        Ok(())
    }

    fn receive_packets(&mut self) -> DeliveryResult<usize> {
        let exited = self
            .process()?
            .child
            .try_wait()
            .map_err(|e| DeliveryError::encoder_stream(format!("Failed to poll ffmpeg: {e}")))?;
        match exited {
            Some(status) if !status.success() => Err(self.exited_early("ffmpeg stopped encoding")),
            _ => Ok(0),
        }
    }

    fn write_trailer(&mut self) -> DeliveryResult<()> {
        let (status, stderr) = self.process()?.wait()?;
        if !status.success() {
            return Err(DeliveryError::encoder_stream(format!(
                "ffmpeg export failed (status {status}): {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn release(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        process.stdin.take();
        if matches!(process.child.try_wait(), Ok(None)) {
            if let Err(e) = process.child.kill() {
                tracing::warn!(error = %e, "Failed to kill ffmpeg");
            }
        }
        let _ = process.child.wait();
        process.join_stderr();
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        self.release();
    }
}
