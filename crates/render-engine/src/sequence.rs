//! Numbered still-image export.
//!
//! Frames are materialized one after another on the calling thread and handed
//! to a rayon pool of writers. A backlog of permits bounds how many frames may
//! wait in memory; every finished or skipped write is counted back on the
//! calling thread, which reports progress and waits for the last file.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender};

use reelout_common::{
    CancelFlag, ChildCancelFlag, DeliveryError, DeliveryResult, CANCEL_POLL_INTERVAL,
};
use reelout_render_model::{
    AlphaMode, BitmapRequest, BitmapSource, BitmapSpec, ChannelLayout, Channels, ColorSpace,
    Config, Representation, CHANNELS, DEPTH, EXR_COMPRESSION, FPS_SCALING, HDR, PRIMARIES,
    RESOLUTION_SCALING_LOG2, SCAN, TIFF_COMPRESSION, TRANSFER,
};

use crate::bitmap_writer::{BitmapWriter, ImageFileWriter, SequenceCodec};
use crate::job::{format_frame_filename, MonotonicProgress, ProgressFn, RenderInputs, RenderJob, RenderTuning};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Counting semaphore; each permit in use is a token in a bounded channel.
pub(crate) struct Backlog {
    taken: Sender<()>,
    returned: Receiver<()>,
}

impl Backlog {
    pub(crate) fn new(permits: usize) -> Self {
        let (taken, returned) = bounded(permits);
        Self { taken, returned }
    }

    /// Take a permit, waiting while all are in use. Gives up once `abort` is raised.
    pub(crate) fn acquire(&self, abort: &ChildCancelFlag) -> DeliveryResult<()> {
        loop {
            abort.check()?;
            match self.taken.send_timeout((), CANCEL_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(())) => {}
                Err(SendTimeoutError::Disconnected(())) => {
                    return Err(DeliveryError::source("frame backlog is closed"));
                }
            }
        }
    }

    pub(crate) fn release(&self) {
        let _ = self.returned.try_recv();
    }
}

/// Tally of finished write tasks, kept on the driving thread.
pub(crate) struct Completions {
    done: Receiver<()>,
    finished: u64,
}

impl Completions {
    pub(crate) fn new(done: Receiver<()>) -> Self {
        Self { done, finished: 0 }
    }

    /// Count every completion sent so far.
    pub(crate) fn drain(&mut self) -> u64 {
        while self.done.try_recv().is_ok() {
            self.finished += 1;
        }
        self.finished
    }

    /// Block until `target` tasks are done, calling `on_tick` with the count on every poll.
    pub(crate) fn wait_for(
        &mut self,
        target: u64,
        abort: &ChildCancelFlag,
        mut on_tick: impl FnMut(u64),
    ) -> DeliveryResult<()> {
        loop {
            on_tick(self.drain());
            if self.finished >= target {
                return Ok(());
            }
            abort.check()?;
            if self.done.recv_timeout(CANCEL_POLL_INTERVAL).is_ok() {
                self.finished += 1;
            }
        }
    }

    /// Wait up to `grace` for `target` tasks. False if some were still running.
    pub(crate) fn settle(&mut self, target: u64, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.drain() < target {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self.done.recv_timeout(deadline - now).is_ok() {
                self.finished += 1;
            }
        }
        true
    }
}

pub(crate) fn build_writer_pool(size: usize) -> DeliveryResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(size.max(1))
        .thread_name(|i| format!("sequence-writer-{i}"))
        .build()
        .map_err(|e| DeliveryError::other(format!("failed to build writer thread pool: {e}")))
}

struct Shared {
    backlog: Backlog,
    first_error: Mutex<Option<DeliveryError>>,
    abort: ChildCancelFlag,
}

impl Shared {
    fn fail(&self, err: DeliveryError) {
        let mut first = lock(&self.first_error);
        if first.is_none() {
            *first = Some(err);
        }
        self.abort.cancel();
    }
}

/// Returns the permit and counts the frame when a write task ends, run or not.
struct TaskGuard {
    shared: Arc<Shared>,
    done: Sender<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.shared.backlog.release();
        let _ = self.done.send(());
    }
}

/// Where and how sequence frames are written.
pub struct SequenceOutput<'a> {
    pub dir: &'a Path,
    /// `%0Nd` pattern applied to 1-based frame numbers.
    pub filename_pattern: &'a str,
    /// Write only the alpha plane of each frame, as gray.
    pub matte: bool,
}

/// Materialize `num_frames` frames from `source` and write one file per frame.
pub fn write_image_sequence(
    source: &mut dyn BitmapSource,
    num_frames: u64,
    writer: Arc<dyn BitmapWriter>,
    output: &SequenceOutput<'_>,
    tuning: &RenderTuning,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> DeliveryResult<()> {
    let pool_size = tuning.pool_size.max(1);
    let shared = Arc::new(Shared {
        backlog: Backlog::new(pool_size * tuning.backlog_factor.max(1)),
        first_error: Mutex::new(None),
        abort: cancel.child(),
    });
    let (done_tx, done_rx) = unbounded();
    let mut completions = Completions::new(done_rx);
    let pool = build_writer_pool(pool_size)?;
    let reporter = MonotonicProgress::new(progress, num_frames);
    tracing::debug!(num_frames, pool_size, dir = %output.dir.display(), "Writing image sequence");

    let mut submitted = 0u64;
    let mut submit_all = || -> DeliveryResult<()> {
        for idx in 0..num_frames {
            shared.abort.check()?;
            let bitmap = source.materialize_frame(idx)?.ok_or_else(|| {
                DeliveryError::source(format!("video ended at frame {idx} of {num_frames}"))
            })?;
            let bitmap = if output.matte {
                bitmap.alpha_plane_view()?
            } else {
                bitmap
            };
            let path: PathBuf = output
                .dir
                .join(format_frame_filename(output.filename_pattern, idx + 1)?);

            // An error here drops the bitmap, which closes it.
            shared.backlog.acquire(&shared.abort)?;
            let guard = TaskGuard {
                shared: shared.clone(),
                done: done_tx.clone(),
            };
            let writer = writer.clone();
            pool.spawn(move || {
                let guard = guard;
                let bitmap = bitmap;
                if guard.shared.abort.is_cancelled() {
                    return;
                }
                let written = panic::catch_unwind(AssertUnwindSafe(|| writer.write(&bitmap, &path)))
                    .unwrap_or_else(|_| {
                        Err(DeliveryError::image(format!(
                            "writer panicked on {}",
                            path.display()
                        )))
                    });
                if let Err(e) = written {
                    guard.shared.fail(e);
                }
                bitmap.close();
            });
            submitted += 1;

            reporter.report(completions.drain());
        }
        Ok(())
    };

    let result = submit_all().and_then(|_| {
        completions.wait_for(num_frames, &shared.abort, |finished| reporter.report(finished))
    });

    if result.is_err() {
        // Queued tasks see the raised flag and return without writing.
        shared.abort.cancel();
    }
    if !completions.settle(submitted, tuning.pool_grace_period) {
        tracing::warn!(
            grace_ms = tuning.pool_grace_period.as_millis() as u64,
            "Image writer threads did not stop within the grace period"
        );
    }
    drop(pool);

    if cancel.is_cancelled() {
        return Err(DeliveryError::Cancelled);
    }
    if let Some(err) = lock(&shared.first_error).take() {
        return Err(err);
    }
    result
}

/// Renders a video as numbered PNG, TIFF or EXR files in a directory.
pub struct ImageSequenceRenderJob {
    codec: SequenceCodec,
    config: Config,
    inputs: RenderInputs,
    filename_pattern: String,
}

impl ImageSequenceRenderJob {
    pub(crate) fn new(
        codec: SequenceCodec,
        config: Config,
        inputs: RenderInputs,
        filename_pattern: String,
    ) -> Self {
        Self {
            codec,
            config,
            inputs,
            filename_pattern,
        }
    }
}

impl RenderJob for ImageSequenceRenderJob {
    fn destination(&self) -> &Path {
        &self.inputs.destination
    }

    fn render(&self, progress: &ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()> {
        let dir = &self.inputs.destination;
        std::fs::create_dir_all(dir)?;

        let config = &self.config;
        let channels = config.get_or_default(&CHANNELS);
        let matte = channels == Channels::Alpha;
        let color_space = ColorSpace::new(
            config.get_or_default(&PRIMARIES),
            config.get_or_default(&TRANSFER),
        );
        let ceiling = if config.get_or_default(&HDR) || color_space.transfer.is_hdr() {
            None
        } else {
            Some(1.0)
        };
        let scan = config.get_or_default(&SCAN);
        let video = self.inputs.video.rescaled(
            2f64.powi(config.get_or_default(&RESOLUTION_SCALING_LOG2)),
            config.get_or_default(&FPS_SCALING).max(1) as u32,
        );

        let (representation, grounding) = match channels {
            Channels::Color => (
                Representation::new(ChannelLayout::Rgb, color_space, AlphaMode::Opaque),
                self.inputs.grounding,
            ),
            Channels::ColorAndAlpha => (
                Representation::new(ChannelLayout::Rgba, color_space, AlphaMode::Straight),
                None,
            ),
            Channels::Alpha => (
                Representation::new(ChannelLayout::Rgba, ColorSpace::BLENDING, AlphaMode::Premultiplied),
                None,
            ),
        };
        let request = BitmapRequest {
            spec: BitmapSpec::new(video.resolution(), representation, scan),
            grounding,
            ceiling,
        };

        let writer = Arc::new(
            ImageFileWriter::new(self.codec, config.get_or_default(&DEPTH))?
                .with_tiff_compression(config.get_or_default(&TIFF_COMPRESSION))
                .with_exr_compression(config.get_or_default(&EXR_COMPRESSION)),
        );
        let mut source = video.bitmap_source(&request)?;
        tracing::info!(
            codec = ?self.codec,
            config = %config,
            frames = video.num_frames(),
            dir = %dir.display(),
            "Image sequence render started"
        );
        write_image_sequence(
            source.as_mut(),
            video.num_frames(),
            writer,
            &SequenceOutput {
                dir,
                filename_pattern: &self.filename_pattern,
                matte,
            },
            &self.inputs.tuning,
            progress,
            cancel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backlog_blocks_until_release() {
        let backlog = Arc::new(Backlog::new(1));
        let abort = CancelFlag::new().child();
        backlog.acquire(&abort).unwrap();

        let waiter = {
            let backlog = backlog.clone();
            let abort = abort.clone();
            std::thread::spawn(move || backlog.acquire(&abort))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        backlog.release();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_backlog_wait_gives_up_on_abort() {
        let backlog = Backlog::new(1);
        let cancel = CancelFlag::new();
        let abort = cancel.child();
        backlog.acquire(&abort).unwrap();
        cancel.cancel();
        assert!(matches!(backlog.acquire(&abort), Err(DeliveryError::Cancelled)));
    }

    #[test]
    fn test_completions_report_until_target() {
        let (tx, rx) = unbounded();
        let mut completions = Completions::new(rx);
        let abort = CancelFlag::new().child();
        let sender = std::thread::spawn(move || {
            tx.send(()).unwrap();
            tx.send(()).unwrap();
        });
        let mut seen = Vec::new();
        completions.wait_for(2, &abort, |n| seen.push(n)).unwrap();
        sender.join().unwrap();
        assert_eq!(seen.last(), Some(&2));
    }

    #[test]
    fn test_settle_times_out_on_missing_tasks() {
        let (tx, rx) = unbounded();
        let mut completions = Completions::new(rx);
        tx.send(()).unwrap();
        assert!(completions.settle(1, Duration::from_millis(10)));
        assert!(!completions.settle(2, Duration::from_millis(10)));
    }

    #[test]
    fn test_writer_pool_threads_are_named() {
        let pool = build_writer_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        let name = pool.install(|| std::thread::current().name().map(str::to_string));
        assert!(name.is_some_and(|n| n.starts_with("sequence-writer-")));
    }

    #[test]
    fn test_aborted_tasks_skip_writing() {
        let pool = build_writer_pool(1).unwrap();
        let cancel = CancelFlag::new();
        let abort = cancel.child();
        cancel.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = unbounded();
        for _ in 0..3 {
            let ran = ran.clone();
            let abort = abort.clone();
            let tx = tx.clone();
            pool.spawn(move || {
                if !abort.is_cancelled() {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
                let _ = tx.send(());
            });
        }
        assert!(Completions::new(rx).settle(3, Duration::from_secs(1)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
