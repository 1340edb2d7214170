//! Reelout Render Engine
//!
//! Turns a laid-out video into deliverable files.
//!
//! # Pipeline Architecture
//!
//! ```text
//! RenderFormat + Config ──► RenderJob ──► RenderQueue (one worker thread)
//!                              │
//!        ┌─────────────────────┼──────────────────────────┐
//!        ▼                     ▼                          ▼
//!  image sequence        video container             tape timeline
//!  materialize (serial)  materializer thread         CSV / CMX3600 EDL
//!        │                     │ bounded channel
//!        ▼                     ▼
//!  writer pool ──► files  VideoWriter ──► MuxBackend (ffmpeg)
//! ```

pub mod bitmap_writer;
pub mod container;
pub mod ffmpeg;
pub mod format;
pub mod job;
pub mod pattern;
pub mod queue;
pub mod sequence;
pub mod tape_timeline;
pub mod video_writer;

pub use bitmap_writer::{BitmapWriter, ImageFileWriter, SequenceCodec};
pub use container::{
    open_first_working, write_video_container, ContainerCodec, ContainerFrames,
    VideoContainerRenderJob,
};
pub use ffmpeg::FfmpegMuxBackend;
pub use format::{
    render_format_by_label, render_formats, render_formats_for_ext, DimensionConstraints,
    FormatKind, FormatSummary, PropertySummary, RenderFormat,
};
pub use job::{
    format_frame_filename, ProgressFn, RenderInputs, RenderJob, RenderTuning,
    MAX_RENDER_PROGRESS,
};
pub use pattern::TestPattern;
pub use queue::{
    ChannelDispatcher, Dispatcher, FinishCallback, ImmediateDispatcher, JobId, ProgressCallback,
    RenderQueue,
};
pub use sequence::{write_image_sequence, ImageSequenceRenderJob, SequenceOutput};
pub use tape_timeline::{TapeTimelineRenderJob, TimelineKind};
pub use video_writer::{
    ColorTags, EncoderSetting, MuxBackend, MuxSession, StreamParams, VideoWriter,
};
