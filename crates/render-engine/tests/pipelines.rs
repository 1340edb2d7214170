mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reelout_common::{CancelFlag, Clock, DeliveryError, DeliveryResult, Fps, TimecodeFormat};
use reelout_render_engine::{
    render_format_by_label, write_image_sequence, write_video_container, BitmapWriter,
    ColorTags, ContainerFrames, EncoderSetting, RenderFormat, RenderInputs, RenderTuning,
    SequenceCodec, SequenceOutput, StreamParams, TestPattern,
};
use reelout_render_model::{
    AlphaMode, Assortment, Bitmap, BitmapLedger, BitmapRequest, BitmapSource, BitmapSpec,
    ChannelLayout, Channels, ColorSpace, Config, DeferredVideo, PixelFormat, Primaries,
    Representation, Resolution, Scan, Tape, TapeSpan, TiffCompression, Transfer, CHANNELS, DEPTH,
    EXR_COMPRESSION, FPS_SCALING, RESOLUTION_SCALING_LOG2, SCAN, TIFF_COMPRESSION,
};

use common::{assert_monotonic_to_max, progress_log, temp_dir, MemoryMux};

fn tuning(pool_size: usize, backlog_factor: usize) -> RenderTuning {
    RenderTuning {
        pool_size,
        backlog_factor,
        prefer_hardware_encoders: false,
        ..RenderTuning::default()
    }
}

fn rgb_spec(resolution: Resolution) -> BitmapSpec {
    BitmapSpec::new(
        resolution,
        Representation::new(ChannelLayout::Rgb, ColorSpace::REC709, AlphaMode::Opaque),
        Scan::Progressive,
    )
}

#[test]
fn custom_format_writes_numbered_frames() {
    let format = RenderFormat::image_sequence(
        "Custom PNG",
        SequenceCodec::Png,
        Assortment::choice(&DEPTH, &[8, 16])
            * Assortment::choice(&CHANNELS, &[Channels::Color, Channels::Alpha]),
    );
    let config = Config::new()
        .with(&DEPTH, 8)
        .with(&CHANNELS, Channels::Color);
    let dir = temp_dir("custom-format");
    let video = Arc::new(TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 10));

    let job = format
        .create_render_job(&config, RenderInputs::new(video, &dir))
        .expect("legal config should build a job");
    let (log, progress) = progress_log();
    job.render(&progress, &CancelFlag::new())
        .expect("render should succeed");

    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    let expected: Vec<String> = (1..=10).map(|n| format!("frame_{n:06}.png")).collect();
    assert_eq!(names, expected);

    let first = image::open(dir.join("frame_000001.png")).unwrap();
    assert_eq!((first.width(), first.height()), (8, 4));
    assert_eq!(first.color(), image::ColorType::Rgb8);
    assert_monotonic_to_max(&log.lock().unwrap());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn illegal_config_is_rejected_before_rendering() {
    let format = render_format_by_label("H.264").unwrap();
    let config = format.default_config().clone().with(&DEPTH, 16);
    let dir = temp_dir("illegal");
    let video = Arc::new(TestPattern::new(Resolution::new(16, 8), Fps::FPS_25, 2));
    let err = format
        .create_render_job(&config, RenderInputs::new(video, dir.join("out.mp4")))
        .err()
        .expect("depth 16 is not offered for H.264");
    assert!(matches!(err, DeliveryError::Configuration { .. }));
    assert!(!dir.exists());
}

#[test]
fn odd_resolution_is_rejected_for_h264() {
    let format = render_format_by_label("H.264").unwrap();
    let video = Arc::new(TestPattern::new(Resolution::new(15, 8), Fps::FPS_25, 2));
    let result = format.create_render_job(
        format.default_config(),
        RenderInputs::new(video, temp_dir("odd").join("out.mp4")),
    );
    assert!(matches!(result, Err(DeliveryError::Configuration { .. })));
}

/// Writer that sleeps and counts, so materialization outpaces it.
struct SlowWriter {
    written: AtomicUsize,
}

impl BitmapWriter for SlowWriter {
    fn write(&self, _bitmap: &Bitmap, _path: &Path) -> DeliveryResult<()> {
        std::thread::sleep(Duration::from_millis(3));
        self.written.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn sequence_backlog_bounds_live_bitmaps() {
    let ledger = BitmapLedger::new();
    let video = TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 40).with_ledger(ledger.clone());
    let request = BitmapRequest {
        spec: rgb_spec(video.resolution()),
        grounding: None,
        ceiling: Some(1.0),
    };
    let mut source = video.bitmap_source(&request).unwrap();
    let writer = Arc::new(SlowWriter {
        written: AtomicUsize::new(0),
    });
    let dir = temp_dir("backlog");
    let (log, progress) = progress_log();

    write_image_sequence(
        source.as_mut(),
        40,
        writer.clone(),
        &SequenceOutput {
            dir: &dir,
            filename_pattern: "f_%03d.png",
            matte: false,
        },
        &tuning(2, 3),
        &progress,
        &CancelFlag::new(),
    )
    .expect("sequence should be written");

    assert_eq!(writer.written.load(Ordering::SeqCst), 40);
    assert_eq!(ledger.total(), 40);
    assert_eq!(ledger.live(), 0);
    // Six permits plus the frame materialized while waiting for one.
    assert!(ledger.peak() <= 7, "peak {} exceeds the backlog", ledger.peak());
    assert_monotonic_to_max(&log.lock().unwrap());
}

#[test]
fn cancelled_sequence_releases_every_bitmap() {
    let ledger = BitmapLedger::new();
    let video = TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 200).with_ledger(ledger.clone());
    let request = BitmapRequest {
        spec: rgb_spec(video.resolution()),
        grounding: None,
        ceiling: None,
    };
    let mut source = video.bitmap_source(&request).unwrap();
    let writer = Arc::new(SlowWriter {
        written: AtomicUsize::new(0),
    });
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let progress = move |value: u32| {
        if value > 0 {
            trigger.cancel();
        }
    };
    let dir = temp_dir("cancel-seq");

    let result = write_image_sequence(
        source.as_mut(),
        200,
        writer.clone(),
        &SequenceOutput {
            dir: &dir,
            filename_pattern: "f_%03d.png",
            matte: false,
        },
        &tuning(2, 2),
        &progress,
        &cancel,
    );

    assert!(matches!(result, Err(DeliveryError::Cancelled)));
    assert!(writer.written.load(Ordering::SeqCst) < 200);
    assert_eq!(ledger.live(), 0);
}

/// Source whose frames carry their index and take uneven time to produce.
struct JitterSource {
    spec: BitmapSpec,
    ledger: BitmapLedger,
    num_frames: u64,
}

impl BitmapSource for JitterSource {
    fn materialize_frame(&mut self, index: u64) -> DeliveryResult<Option<Bitmap>> {
        if index >= self.num_frames {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_micros((index * 7919 % 13) * 150));
        let mut bitmap = self.ledger.allocate(self.spec);
        bitmap.plane_mut(0).fill(index as f32);
        Ok(Some(bitmap))
    }
}

fn stream_params(resolution: Resolution) -> StreamParams {
    StreamParams {
        resolution,
        fps: Fps::FPS_25,
        scan: Scan::Progressive,
        input: rgb_spec(resolution).representation,
        color: ColorTags {
            primaries: Primaries::Bt709,
            transfer: Transfer::Bt1886,
            matrix: "bt709",
            full_range: false,
        },
        metadata: Vec::new(),
    }
}

#[test]
fn container_frames_arrive_in_index_order() {
    let resolution = Resolution::new(4, 2);
    let ledger = BitmapLedger::new();
    let source = JitterSource {
        spec: rgb_spec(resolution),
        ledger: ledger.clone(),
        num_frames: 60,
    };
    let mux = MemoryMux::default();
    let mut tuning = tuning(1, 1);
    tuning.container_queue_capacity = 4;
    let (log, progress) = progress_log();

    write_video_container(
        Box::new(source),
        &ContainerFrames {
            num_frames: 60,
            writer_spec: rgb_spec(resolution),
            matte: false,
        },
        &mux,
        Path::new("memory.mov"),
        &stream_params(resolution),
        &[EncoderSetting::new("test", PixelFormat::Yuv422p10)],
        &tuning,
        &progress,
        &CancelFlag::new(),
    )
    .expect("container should be written");

    let frames = mux.frames();
    assert_eq!(frames.len(), 60);
    for (idx, (pts, value)) in frames.iter().enumerate() {
        assert_eq!(*pts, idx as i64);
        assert_eq!(*value, idx as f32);
    }
    assert!(mux.trailer_written());
    assert_eq!(ledger.live(), 0);
    assert_eq!(ledger.total(), 60);
    assert_monotonic_to_max(&log.lock().unwrap());
}

#[test]
fn cancelled_container_stops_and_releases_buffers() {
    let resolution = Resolution::new(4, 2);
    let ledger = BitmapLedger::new();
    let source = JitterSource {
        spec: rgb_spec(resolution),
        ledger: ledger.clone(),
        num_frames: 500,
    };
    let mux = MemoryMux::default();
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let progress = move |value: u32| {
        if value >= 100 {
            trigger.cancel();
        }
    };

    let result = write_video_container(
        Box::new(source),
        &ContainerFrames {
            num_frames: 500,
            writer_spec: rgb_spec(resolution),
            matte: false,
        },
        &mux,
        Path::new("memory.mov"),
        &stream_params(resolution),
        &[EncoderSetting::new("test", PixelFormat::Yuv422p10)],
        &tuning(1, 1),
        &progress,
        &cancel,
    );

    assert!(matches!(result, Err(DeliveryError::Cancelled)));
    assert!(mux.frames().len() < 500);
    assert!(!mux.trailer_written());
    assert_eq!(ledger.live(), 0);
}

#[test]
fn h264_job_encodes_every_scaled_frame() {
    let format = render_format_by_label("H.264").unwrap();
    let mux = MemoryMux::default();
    let config = format
        .default_config()
        .clone()
        .with(&FPS_SCALING, 2);
    let video = Arc::new(TestPattern::new(Resolution::new(16, 8), Fps::FPS_25, 6));
    let dir = temp_dir("h264");
    let inputs = RenderInputs::new(video, dir.join("credits.mp4"))
        .with_mux_backend(Arc::new(mux.clone()))
        .with_tuning(tuning(1, 1));

    let job = format.create_render_job(&config, inputs).unwrap();
    let (log, progress) = progress_log();
    job.render(&progress, &CancelFlag::new()).unwrap();

    assert_eq!(mux.codecs().last().map(String::as_str), Some("libx264"));
    assert_eq!(mux.frames().len(), 12);
    assert!(mux.trailer_written());
    assert_monotonic_to_max(&log.lock().unwrap());
    assert!(dir.exists());
    let _ = std::fs::remove_dir_all(&dir);
}

fn tape_video() -> Arc<TestPattern> {
    let spans = vec![
        TapeSpan {
            tape: Tape::new("b-roll.mov", None),
            first_frame_idx: 25,
            last_frame_idx: 74,
            first_read_timecode: Clock::new(3600, 1),
        },
        TapeSpan {
            tape: Tape::new("intro.mov", None),
            first_frame_idx: 0,
            last_frame_idx: 49,
            first_read_timecode: Clock::new(0, 1),
        },
    ];
    Arc::new(TestPattern::new(Resolution::new(16, 8), Fps::FPS_25, 100).with_tape_spans(spans))
}

#[test]
fn csv_timeline_lists_spans_in_record_order() {
    let format = render_format_by_label("CSV").unwrap();
    let path = temp_dir("csv").join("tapes.csv");
    let inputs = RenderInputs::new(tape_video(), &path).with_timecode_format(TimecodeFormat::Frames);
    let job = format.create_render_job(format.default_config(), inputs).unwrap();
    let (log, progress) = progress_log();
    job.render(&progress, &CancelFlag::new()).unwrap();

    let csv = std::fs::read_to_string(&path).unwrap();
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[1].ends_with(",\"intro.mov\""));
    assert!(rows[2].starts_with("\"000025\",\"000075\",\"01:00:00:00\""));
    assert_monotonic_to_max(&log.lock().unwrap());
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn edl_timeline_trims_overlapping_clips() {
    let format = render_format_by_label("EDL").unwrap();
    let path = temp_dir("edl").join("credits.edl");
    let job = format
        .create_render_job(format.default_config(), RenderInputs::new(tape_video(), &path))
        .unwrap();
    job.render(&|_: u32| {}, &CancelFlag::new()).unwrap();

    let edl = std::fs::read_to_string(&path).unwrap();
    assert!(edl.starts_with("TITLE: credits\r\nFCM: NON-DROP FRAME\r\n"));
    assert!(edl.contains("001  AX       V     C        00:00:00:00 00:00:01:00 00:00:00:00 00:00:01:00"));
    assert!(edl.contains("002  AX       V     C        01:00:00:00 01:00:02:00 00:00:01:00 00:00:03:00"));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn cancelled_job_reports_cancellation() {
    let format = render_format_by_label("PNG").unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let video = Arc::new(TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 3));
    let dir = temp_dir("pre-cancel");
    let job = format
        .create_render_job(format.default_config(), RenderInputs::new(video, &dir))
        .unwrap();
    let err = job.render(&|_: u32| {}, &cancel).unwrap_err();
    assert!(err.is_cancellation());
    let written = std::fs::read_dir(&dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(written, 0);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn matte_sequence_writes_gray_frames() {
    let format = render_format_by_label("TIFF").unwrap();
    let config = Config::new()
        .with(&CHANNELS, Channels::Alpha)
        .with(&DEPTH, 16)
        .with(&TIFF_COMPRESSION, TiffCompression::Deflate)
        .with(&RESOLUTION_SCALING_LOG2, 0)
        .with(&FPS_SCALING, 1)
        .with(&SCAN, Scan::Progressive);
    assert!(format.contains(&config), "{config}");
    let dir = temp_dir("matte");
    let video = Arc::new(TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 2));
    let job = format
        .create_render_job(&config, RenderInputs::new(video, &dir).with_filename_pattern("matte.%04d.tiff"))
        .unwrap();
    job.render(&|_: u32| {}, &CancelFlag::new()).unwrap();

    let matte = image::open(dir.join("matte.0002.tiff")).unwrap();
    assert_eq!(matte.color(), image::ColorType::L16);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn half_float_exr_sequence() {
    let format = render_format_by_label("EXR").unwrap();
    let config = format.default_config().clone().with(&DEPTH, 16);
    assert_eq!(config.get(&EXR_COMPRESSION), Some(reelout_render_model::ExrCompression::Zip));
    let dir = temp_dir("exr-half");
    let video = Arc::new(TestPattern::new(Resolution::new(8, 4), Fps::FPS_25, 2));
    let job = format
        .create_render_job(&config, RenderInputs::new(video, &dir))
        .unwrap();
    job.render(&|_: u32| {}, &CancelFlag::new()).unwrap();

    let frame = image::open(dir.join("frame_000002.exr")).unwrap();
    assert_eq!((frame.width(), frame.height()), (8, 4));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn otio_timeline_stacks_overlapping_clips() {
    let format = render_format_by_label("OTIO").unwrap();
    let path = temp_dir("otio").join("credits.otio");
    let job = format
        .create_render_job(format.default_config(), RenderInputs::new(tape_video(), &path))
        .unwrap();
    job.render(&|_: u32| {}, &CancelFlag::new()).unwrap();

    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["OTIO_SCHEMA"], "Timeline.1");
    assert_eq!(doc["name"], "credits");
    let tracks = doc["tracks"]["children"].as_array().unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0]["children"][0]["name"], "intro.mov");
    // The second track opens with a one-second gap before b-roll.mov.
    assert_eq!(tracks[1]["children"][0]["OTIO_SCHEMA"], "Gap.1");
    assert_eq!(tracks[1]["children"][0]["source_range"]["duration"]["value"], 25.0);
    assert_eq!(tracks[1]["children"][1]["name"], "b-roll.mov");
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn fcpxml_timeline_lists_asset_clips() {
    let format = render_format_by_label("FCPXML").unwrap();
    let path = temp_dir("fcpxml").join("credits.fcpxml");
    let job = format
        .create_render_job(format.default_config(), RenderInputs::new(tape_video(), &path))
        .unwrap();
    job.render(&|_: u32| {}, &CancelFlag::new()).unwrap();

    let xml = std::fs::read_to_string(&path).unwrap();
    assert!(xml.contains("<fcpxml version=\"1.9\">"));
    assert!(xml.contains("<project name=\"credits\">"));
    assert_eq!(xml.matches("<asset-clip ").count(), 2);
    assert!(xml.contains("name=\"b-roll.mov\" ref=\"r2\" offset=\"1/1s\" start=\"3600/1s\" duration=\"2/1s\" lane=\"2\""));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn progress_callback_shared_across_threads() {
    let calls = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&calls);
    let progress = move |_value: u32| *counter.lock().unwrap() += 1;
    let format = render_format_by_label("PNG").unwrap();
    let video = Arc::new(TestPattern::new(Resolution::new(4, 2), Fps::FPS_25, 5));
    let dir = temp_dir("progress");
    let job = format
        .create_render_job(
            format.default_config(),
            RenderInputs::new(video, &dir).with_tuning(tuning(3, 1)),
        )
        .unwrap();
    job.render(&progress, &CancelFlag::new()).unwrap();
    assert!(*calls.lock().unwrap() >= 1);
    let _ = std::fs::remove_dir_all(&dir);
}
