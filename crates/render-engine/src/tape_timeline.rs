//! Timelines listing where source tapes appear in the rendered video.
//!
//! Flat lists (CSV, CMX3600 EDL) keep spans in record order and trim overlaps.
//! The editor interchange formats (OpenTimelineIO, FCPXML, FCP7 XML) instead
//! stack overlapping spans onto extra tracks.

use std::fmt::{self, Write as _};
use std::path::Path;

use serde::Serialize;
use serde_json::{json, Value as Json};

use reelout_common::{
    ceil_div, format_timecode, smpte_drop_frame, smpte_non_drop_frame, CancelFlag, Clock,
    DeliveryResult, Fps, TimecodeFormat,
};
use reelout_render_model::{
    AvailableRange, Config, Resolution, Scan, Tape, TapeSpan, FPS_SCALING, SCAN,
};

use crate::job::{ProgressFn, RenderInputs, RenderJob, MAX_RENDER_PROGRESS};

/// Events past this number do not fit the three-digit CMX3600 event field.
const MAX_EDL_EVENTS: usize = 999;

const TOP_FIELD_MARK: &str = " \u{25D3}";
const BOTTOM_FIELD_MARK: &str = " \u{25D2}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Csv,
    /// CMX3600 edit decision list.
    Edl,
    /// OpenTimelineIO JSON.
    Otio,
    /// Final Cut Pro X XML.
    Fcpxml,
    /// Final Cut Pro 7 XML interchange, also read by Premiere.
    Xml,
}

/// Tape spans measured in fields for interlaced scan, in frames otherwise.
struct Timeline {
    spans: Vec<TapeSpan>,
    /// Frame rate of the exported video.
    fps: Fps,
    resolution: Resolution,
    /// Length of the exported video in frames.
    num_frames: u64,
    scan: Scan,
    /// Spans per exported frame: 2 for interlaced scan.
    field_mul: u64,
}

impl Timeline {
    fn start_frame(&self, span: &TapeSpan) -> u64 {
        span.first_frame_idx / self.field_mul
    }

    fn stop_frame(&self, span: &TapeSpan) -> u64 {
        ceil_div(span.last_frame_idx + 1, self.field_mul)
    }

    fn offset_clock(&self, span: &TapeSpan) -> Clock {
        Clock::from_frames(span.first_frame_idx, self.fps) / self.field_mul
    }

    fn duration_clock(&self, span: &TapeSpan) -> Clock {
        Clock::from_frames(span.duration_frames(), self.fps) / self.field_mul
    }

    fn tape_fps(&self, tape: &Tape) -> Fps {
        tape.fps.unwrap_or(self.fps)
    }

    fn tape_format(&self, tape: &Tape) -> (Resolution, Fps) {
        (tape.resolution.unwrap_or(self.resolution), self.tape_fps(tape))
    }

    /// The tape's footage range; when unknown, from zero to the end of the last read.
    fn available_range(&self, tape: &Tape) -> AvailableRange {
        tape.available_range.unwrap_or_else(|| AvailableRange {
            start: Clock::new(0, 1),
            duration: self
                .spans
                .iter()
                .filter(|s| s.tape == *tape)
                .map(|s| s.first_read_timecode + self.duration_clock(s))
                .fold(Clock::new(0, 1), Clock::later),
        })
    }

    /// Distinct tapes in order of first appearance.
    fn tapes(&self) -> Vec<&Tape> {
        let mut tapes: Vec<&Tape> = Vec::new();
        for span in &self.spans {
            if !tapes.contains(&&span.tape) {
                tapes.push(&span.tape);
            }
        }
        tapes
    }

    fn field_mark(&self, field: u64) -> &'static str {
        let tff = self.scan == Scan::InterlacedTopFieldFirst;
        if (field % 2 == 0) == tff {
            TOP_FIELD_MARK
        } else {
            BOTTOM_FIELD_MARK
        }
    }
}

fn smpte(clock_frames: u64, fps: Fps, drop_frame: bool) -> DeliveryResult<String> {
    if drop_frame {
        // CMX3600 readers expect colons throughout.
        Ok(smpte_drop_frame(clock_frames, fps)?
            .format(fps)
            .replace(';', ":"))
    } else {
        Ok(smpte_non_drop_frame(clock_frames, fps).format(fps))
    }
}

fn write_csv(timeline: &Timeline, timecode_format: TimecodeFormat) -> DeliveryResult<String> {
    let mut csv = String::from("Record In,Record Out,Source In,Source In Clock,Source\n");
    for span in &timeline.spans {
        let start_field = span.first_frame_idx;
        let stop_field = span.last_frame_idx + 1;
        let mut rec_in = format_timecode(timeline.fps, timecode_format, timeline.start_frame(span))?;
        let mut rec_out = format_timecode(timeline.fps, timecode_format, timeline.stop_frame(span))?;
        if timeline.scan.is_interlaced() {
            rec_in.push_str(timeline.field_mark(start_field));
            rec_out.push_str(timeline.field_mark(stop_field));
        }
        let tape_fps = span.tape.fps.unwrap_or(timeline.fps);
        let tape_start = span.first_read_timecode;
        let src_in = smpte_non_drop_frame(tape_start.to_frames(tape_fps), tape_fps).format(tape_fps);
        let _ = writeln!(
            csv,
            "\"{rec_in}\",\"{rec_out}\",\"{src_in}\",\"{tape_start}\",\"{}\"",
            span.tape.name.replace('"', "\"\"")
        );
    }
    Ok(csv)
}

fn write_edl(timeline: &Timeline, title: &str) -> DeliveryResult<String> {
    let fps = timeline.fps;
    let drop_frame = fps.supports_drop_frame();
    let mut edl = String::new();
    let _ = write!(edl, "TITLE: {title}\r\n");
    let _ = write!(
        edl,
        "FCM: {}\r\n",
        if drop_frame { "DROP FRAME" } else { "NON-DROP FRAME" }
    );

    let mut event = 1;
    for (idx, span) in timeline.spans.iter().enumerate() {
        if event > MAX_EDL_EVENTS {
            break;
        }
        let start = timeline.start_frame(span);
        let mut stop = timeline.stop_frame(span);
        if let Some(next) = timeline.spans.get(idx + 1) {
            stop = stop.min(timeline.start_frame(next));
        }
        if stop <= start {
            continue;
        }
        let length = stop - start;
        // Source frames are counted at the video's rate, as if the tape had been rescaled to it.
        let tape_start = span.first_read_timecode;
        let tape_end: Clock = tape_start + Clock::from_frames(length, fps);
        let src_in = smpte(tape_start.to_frames(fps), fps, drop_frame)?;
        let src_out = smpte(tape_end.to_frames(fps), fps, drop_frame)?;
        let rec_in = smpte(start, fps, drop_frame)?;
        let rec_out = smpte(stop, fps, drop_frame)?;
        let _ = write!(
            edl,
            "\r\n{event:03}  AX       V     C        {src_in} {src_out} {rec_in} {rec_out} \r\n"
        );
        let _ = write!(edl, "* FROM CLIP NAME: {}\r\n", span.tape.name);
        event += 1;
    }
    Ok(edl)
}

/// Greedy track assignment: each span goes on the first track that is free by
/// its first frame, or opens a new track.
fn arrange_on_tracks(spans: &[TapeSpan]) -> Vec<Vec<&TapeSpan>> {
    let mut tracks: Vec<Vec<&TapeSpan>> = Vec::new();
    for span in spans {
        let free = tracks.iter_mut().find(|track| {
            track
                .last()
                .is_some_and(|last| last.last_frame_idx < span.first_frame_idx)
        });
        match free {
            Some(track) => track.push(span),
            None => tracks.push(vec![span]),
        }
    }
    tracks
}

fn otio_time(value: f64, rate: f64) -> Json {
    json!({
        "OTIO_SCHEMA": "RationalTime.1",
        "value": value,
        "rate": rate,
    })
}

fn otio_range(start: f64, duration: f64, rate: f64) -> Json {
    json!({
        "OTIO_SCHEMA": "TimeRange.1",
        "start_time": otio_time(start, rate),
        "duration": otio_time(duration, rate),
    })
}

fn otio_clock_range(start: Clock, duration: Clock, fps: Fps) -> Json {
    otio_range(start.frames_f64(fps), duration.frames_f64(fps), fps.as_f64())
}

fn write_otio(timeline: &Timeline, name: &str) -> DeliveryResult<String> {
    let rate = timeline.fps.as_f64();
    let tracks: Vec<Json> = arrange_on_tracks(&timeline.spans)
        .into_iter()
        .map(|track| {
            let mut children = Vec::new();
            let mut frame_idx = 0;
            for span in track {
                if span.first_frame_idx != frame_idx {
                    let gap = (span.first_frame_idx - frame_idx) as f64 / timeline.field_mul as f64;
                    children.push(json!({
                        "OTIO_SCHEMA": "Gap.1",
                        "source_range": otio_range(0.0, gap, rate),
                    }));
                }
                frame_idx = span.last_frame_idx + 1;
                let tape_fps = timeline.tape_fps(&span.tape);
                let available = timeline.available_range(&span.tape);
                children.push(json!({
                    "OTIO_SCHEMA": "Clip.1",
                    "name": span.tape.name,
                    "source_range": otio_clock_range(
                        span.first_read_timecode,
                        timeline.duration_clock(span),
                        tape_fps,
                    ),
                    "media_reference": {
                        "OTIO_SCHEMA": "ExternalReference.1",
                        "name": span.tape.name,
                        "target_url": span.tape.name,
                        "available_range": otio_clock_range(available.start, available.duration, tape_fps),
                    },
                }));
            }
            json!({
                "OTIO_SCHEMA": "Track.1",
                "kind": "Audio",
                "source_range": otio_range(0.0, timeline.num_frames as f64, rate),
                "children": children,
            })
        })
        .collect();

    let doc = json!({
        "OTIO_SCHEMA": "Timeline.1",
        "name": name,
        "global_start_time": otio_time(0.0, rate),
        "tracks": {
            "OTIO_SCHEMA": "Stack.1",
            "name": name,
            "children": tracks,
        },
    });
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Indented XML text with escaped attributes and content.
struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new(doctype: &str) -> Self {
        Self {
            out: format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE {doctype}>\n"),
            depth: 0,
        }
    }

    fn start_tag(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push('<');
        self.out.push_str(tag);
        for (key, value) in attrs {
            let _ = write!(self.out, " {key}=\"{}\"", escape_xml(value));
        }
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.start_tag(tag, attrs);
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn empty(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.start_tag(tag, attrs);
        self.out.push_str("/>\n");
    }

    fn text(&mut self, tag: &str, text: impl fmt::Display) {
        self.start_tag(tag, &[]);
        let _ = writeln!(self.out, ">{}</{tag}>", escape_xml(&text.to_string()));
    }

    fn close(&mut self, tag: &str) {
        self.depth = self.depth.saturating_sub(1);
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        let _ = writeln!(self.out, "</{tag}>");
    }

    fn finish(self) -> String {
        self.out
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Rational time as FCPXML writes it, e.g. `1001/30000s`.
fn fcp_time(clock: Clock) -> String {
    let clock = clock.reduced();
    format!("{}/{}s", clock.numerator, clock.denominator)
}

fn write_fcpxml(timeline: &Timeline, name: &str) -> String {
    let tapes = timeline.tapes();
    let mut formats = vec![(timeline.resolution, timeline.fps)];
    for tape in &tapes {
        let format = timeline.tape_format(tape);
        if !formats.contains(&format) {
            formats.push(format);
        }
    }
    // Formats take ids r0.., assets continue the numbering.
    let format_id = |format: (Resolution, Fps)| {
        format!("r{}", formats.iter().position(|f| *f == format).unwrap_or(0))
    };
    let asset_id = |tape_idx: usize| format!("r{}", formats.len() + tape_idx);
    let duration = fcp_time(Clock::from_frames(timeline.num_frames, timeline.fps));

    let mut xml = XmlWriter::new("fcpxml");
    xml.open("fcpxml", &[("version", "1.9")]);
    xml.open("resources", &[]);
    for (idx, (resolution, fps)) in formats.iter().enumerate() {
        xml.empty(
            "format",
            &[
                ("id", format!("r{idx}").as_str()),
                ("width", resolution.width.to_string().as_str()),
                ("height", resolution.height.to_string().as_str()),
                ("frameDuration", format!("{}/{}s", fps.denominator, fps.numerator).as_str()),
            ],
        );
    }
    for (idx, tape) in tapes.iter().enumerate() {
        let available = timeline.available_range(tape);
        xml.open(
            "asset",
            &[
                ("id", asset_id(idx).as_str()),
                ("name", tape.name.as_str()),
                ("format", format_id(timeline.tape_format(tape)).as_str()),
                ("start", fcp_time(available.start).as_str()),
                ("duration", fcp_time(available.duration).as_str()),
                ("hasAudio", "1"),
            ],
        );
        xml.empty("media-rep", &[("kind", "original-media"), ("src", tape.name.as_str())]);
        xml.close("asset");
    }
    xml.close("resources");

    xml.open("library", &[]);
    xml.open("event", &[("name", name)]);
    xml.open("project", &[("name", name)]);
    xml.open(
        "sequence",
        &[
            ("format", "r0"),
            ("tcStart", "0/1s"),
            ("tcFormat", if timeline.fps.supports_drop_frame() { "DF" } else { "NDF" }),
            ("duration", duration.as_str()),
        ],
    );
    xml.open("spine", &[]);
    xml.open("gap", &[("offset", "0/1s"), ("duration", duration.as_str())]);
    for (track_idx, track) in arrange_on_tracks(&timeline.spans).iter().enumerate() {
        for span in track {
            let tape_idx = tapes.iter().position(|t| **t == span.tape).unwrap_or(0);
            xml.empty(
                "asset-clip",
                &[
                    ("name", span.tape.name.as_str()),
                    ("ref", asset_id(tape_idx).as_str()),
                    ("offset", fcp_time(timeline.offset_clock(span)).as_str()),
                    ("start", fcp_time(span.first_read_timecode).as_str()),
                    ("duration", fcp_time(timeline.duration_clock(span)).as_str()),
                    ("lane", (track_idx + 1).to_string().as_str()),
                ],
            );
        }
    }
    for tag in ["gap", "spine", "sequence", "project", "event", "library", "fcpxml"] {
        xml.close(tag);
    }
    xml.finish()
}

fn xml_rate(xml: &mut XmlWriter, fps: Fps) {
    let timebase = (fps.numerator + fps.denominator / 2) / fps.denominator;
    xml.open("rate", &[]);
    xml.text("timebase", timebase);
    xml.text("ntsc", if fps.supports_drop_frame() { "TRUE" } else { "FALSE" });
    xml.close("rate");
}

fn xml_timecode(xml: &mut XmlWriter, fps: Fps, frames: u64) -> DeliveryResult<()> {
    let drop_frame = fps.supports_drop_frame();
    let string = if drop_frame {
        smpte_drop_frame(frames, fps)?.format(fps)
    } else {
        smpte_non_drop_frame(frames, fps).format(fps)
    };
    xml.open("timecode", &[]);
    xml.text("string", string);
    xml.text("displayformat", if drop_frame { "DF" } else { "NDF" });
    xml_rate(xml, fps);
    xml.close("timecode");
    Ok(())
}

fn write_xml(timeline: &Timeline, name: &str) -> DeliveryResult<String> {
    let fps = timeline.fps;
    let mut xml = XmlWriter::new("xmeml");
    xml.open("xmeml", &[("version", "5")]);
    xml.open("sequence", &[]);
    xml.text("name", name);
    xml.text("duration", timeline.num_frames);
    xml_rate(&mut xml, fps);
    xml_timecode(&mut xml, fps, 0)?;

    xml.open("media", &[]);
    xml.open("video", &[]);
    xml.open("format", &[]);
    xml.open("samplecharacteristics", &[]);
    xml.text("width", timeline.resolution.width);
    xml.text("height", timeline.resolution.height);
    xml_rate(&mut xml, fps);
    for tag in ["samplecharacteristics", "format", "video"] {
        xml.close(tag);
    }

    xml.open("audio", &[]);
    // The first clip of a tape describes its file, later clips refer to it by id.
    let mut files: Vec<&Tape> = Vec::new();
    for track in arrange_on_tracks(&timeline.spans) {
        xml.open("track", &[]);
        for span in track {
            let start = timeline.start_frame(span);
            let stop = timeline.stop_frame(span);
            let in_point = span.first_read_timecode.to_frames(fps);
            xml.open("clipitem", &[]);
            xml.text("name", &span.tape.name);
            xml.text("duration", stop - start);
            xml_rate(&mut xml, fps);
            xml.text("start", start);
            xml.text("end", stop);
            xml.text("in", in_point);
            xml.text("out", in_point + (stop - start));
            match files.iter().position(|t| **t == span.tape) {
                Some(idx) => xml.empty("file", &[("id", format!("f{idx}").as_str())]),
                None => {
                    let id = format!("f{}", files.len());
                    files.push(&span.tape);
                    let tape_fps = timeline.tape_fps(&span.tape);
                    let available = timeline.available_range(&span.tape);
                    xml.open("file", &[("id", id.as_str())]);
                    xml.text("duration", available.duration.to_frames_ceil(tape_fps));
                    xml_rate(&mut xml, tape_fps);
                    xml.text("name", &span.tape.name);
                    xml.text("pathurl", &span.tape.name);
                    xml_timecode(&mut xml, tape_fps, available.start.to_frames(tape_fps))?;
                    xml.open("media", &[]);
                    xml.empty("audio", &[]);
                    xml.close("media");
                    xml.close("file");
                }
            }
            xml.close("clipitem");
        }
        xml.close("track");
    }
    for tag in ["audio", "media", "sequence", "xmeml"] {
        xml.close(tag);
    }
    Ok(xml.finish())
}

/// Renders the tape spans of a video as a list, an EDL or an editor timeline.
pub struct TapeTimelineRenderJob {
    kind: TimelineKind,
    config: Config,
    inputs: RenderInputs,
}

impl TapeTimelineRenderJob {
    pub(crate) fn new(kind: TimelineKind, config: Config, inputs: RenderInputs) -> Self {
        Self {
            kind,
            config,
            inputs,
        }
    }

    fn timeline(&self) -> Timeline {
        let scan = self.config.get_or_default(&SCAN);
        let fps_scaling = self.config.get_or_default(&FPS_SCALING).max(1) as u32;
        let field_mul: u32 = if scan.is_interlaced() { 2 } else { 1 };
        let video = self.inputs.video.rescaled(1.0, fps_scaling * field_mul);
        let mut spans = video.tape_spans();
        spans.sort_by_key(|s| (s.first_frame_idx, s.last_frame_idx));
        Timeline {
            spans,
            fps: self.inputs.video.fps().scaled(fps_scaling),
            resolution: self.inputs.video.resolution(),
            num_frames: self.inputs.video.rescaled(1.0, fps_scaling).num_frames(),
            scan,
            field_mul: field_mul as u64,
        }
    }
}

impl RenderJob for TapeTimelineRenderJob {
    fn destination(&self) -> &Path {
        &self.inputs.destination
    }

    fn render(&self, progress: &ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()> {
        cancel.check()?;
        let path = &self.inputs.destination;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let timeline = self.timeline();
        tracing::info!(
            kind = ?self.kind,
            spans = timeline.spans.len(),
            path = %path.display(),
            "Tape timeline render started"
        );
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = match self.kind {
            TimelineKind::Csv => write_csv(&timeline, self.inputs.timecode_format)?,
            TimelineKind::Edl => write_edl(&timeline, &title)?,
            TimelineKind::Otio => write_otio(&timeline, &title)?,
            TimelineKind::Fcpxml => write_fcpxml(&timeline, &title),
            TimelineKind::Xml => write_xml(&timeline, &title)?,
        };
        cancel.check()?;
        std::fs::write(path, text)?;
        progress(MAX_RENDER_PROGRESS);
        Ok(())
    }
}
