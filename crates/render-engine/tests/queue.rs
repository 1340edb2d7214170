use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver};
use reelout_common::{CancelFlag, DeliveryError, DeliveryResult};
use reelout_render_engine::{
    ChannelDispatcher, Dispatcher, ImmediateDispatcher, ProgressFn, RenderJob, RenderQueue,
    MAX_RENDER_PROGRESS,
};

/// Job that records its start in a shared log and runs until told to stop.
struct ScriptedJob {
    name: &'static str,
    destination: PathBuf,
    log: Arc<Mutex<Vec<&'static str>>>,
    release: Arc<AtomicBool>,
    fail: bool,
}

impl RenderJob for ScriptedJob {
    fn destination(&self) -> &Path {
        &self.destination
    }

    fn render(&self, progress: &ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()> {
        self.log.lock().unwrap().push(self.name);
        while !self.release.load(Ordering::SeqCst) {
            cancel.check()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        progress(MAX_RENDER_PROGRESS / 2);
        if self.fail {
            return Err(DeliveryError::source("scripted failure"));
        }
        Ok(())
    }
}

/// Job whose frame source blows up mid-render.
struct PanickingJob {
    destination: PathBuf,
}

impl RenderJob for PanickingJob {
    fn destination(&self) -> &Path {
        &self.destination
    }

    fn render(&self, _progress: &ProgressFn, _cancel: &CancelFlag) -> DeliveryResult<()> {
        panic!("frame source exploded");
    }
}

struct Harness {
    queue: RenderQueue,
    log: Arc<Mutex<Vec<&'static str>>>,
    finished: Receiver<(&'static str, Option<DeliveryError>)>,
    finish_tx: crossbeam::channel::Sender<(&'static str, Option<DeliveryError>)>,
    progress_calls: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let (finish_tx, finished) = unbounded();
        Self {
            queue: RenderQueue::start().expect("queue should start"),
            log: Arc::new(Mutex::new(Vec::new())),
            finished,
            finish_tx,
            progress_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn submit(&self, name: &'static str, release: &Arc<AtomicBool>, fail: bool) -> u64 {
        self.submit_with(name, release, fail, Arc::new(ImmediateDispatcher))
    }

    fn submit_with(
        &self,
        name: &'static str,
        release: &Arc<AtomicBool>,
        fail: bool,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> u64 {
        let job = ScriptedJob {
            name,
            destination: PathBuf::from(format!("/renders/{name}")),
            log: Arc::clone(&self.log),
            release: Arc::clone(release),
            fail,
        };
        let calls = Arc::clone(&self.progress_calls);
        let tx = self.finish_tx.clone();
        self.queue.submit_job(
            Box::new(job),
            dispatcher,
            Arc::new(move |_: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |err: Option<DeliveryError>| {
                let _ = tx.send((name, err));
            }),
        )
    }

    fn submit_panicking(&self, name: &'static str) -> u64 {
        let tx = self.finish_tx.clone();
        self.queue.submit_job(
            Box::new(PanickingJob {
                destination: PathBuf::from(format!("/renders/{name}")),
            }),
            Arc::new(ImmediateDispatcher),
            Arc::new(|_: u32| {}),
            Box::new(move |err: Option<DeliveryError>| {
                let _ = tx.send((name, err));
            }),
        )
    }

    fn next_finished(&self) -> (&'static str, Option<DeliveryError>) {
        self.finished
            .recv_timeout(Duration::from_secs(10))
            .expect("a job should finish")
    }

    fn started(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }
}

fn released() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn jobs_run_in_submission_order() {
    let h = Harness::new();
    let release = released();
    h.submit("a", &release, false);
    h.submit("b", &release, true);
    h.submit("c", &release, false);

    let finished: Vec<_> = (0..3).map(|_| h.next_finished()).collect();
    assert_eq!(h.started(), ["a", "b", "c"]);
    assert_eq!(finished[0].0, "a");
    assert!(finished[0].1.is_none());
    assert!(matches!(finished[1].1, Some(DeliveryError::Source { .. })));
    assert!(finished[2].1.is_none());
    // 0, midway and max for each successful job; 0 and midway for the failure.
    assert_eq!(h.progress_calls.load(Ordering::SeqCst), 8);
}

#[test]
fn job_cancelled_before_start_gets_no_callbacks() {
    let h = Harness::new();
    let hold = Arc::new(AtomicBool::new(false));
    h.submit("running", &hold, false);
    wait_until(|| h.started() == ["running"]);

    let skipped = h.submit("skipped", &released(), false);
    h.queue.cancel_job(skipped);
    assert_eq!(h.queue.remaining_jobs(), 1);
    hold.store(true, Ordering::SeqCst);

    let (name, err) = h.next_finished();
    assert_eq!(name, "running");
    assert!(err.is_none());
    h.submit("after", &released(), false);
    let (name, _) = h.next_finished();
    assert_eq!(name, "after");
    assert_eq!(h.started(), ["running", "after"]);
}

#[test]
fn cancelling_running_job_reports_cancellation() {
    let h = Harness::new();
    let hold = Arc::new(AtomicBool::new(false));
    let id = h.submit("long", &hold, false);
    wait_until(|| h.started() == ["long"]);
    assert!(h.queue.is_rendered_file_of_remaining_job(Path::new("/renders/long/frame_1.png")));

    h.queue.cancel_job(id);
    let (name, err) = h.next_finished();
    assert_eq!(name, "long");
    assert!(err.is_some_and(|e| e.is_cancellation()));
    assert_eq!(h.queue.remaining_jobs(), 0);
    assert!(h.queue.is_rendered_file(Path::new("/renders/long/frame_1.png")));
}

#[test]
fn pause_holds_jobs_until_resumed() {
    let h = Harness::new();
    h.queue.set_paused(true);
    assert!(h.queue.is_paused());
    h.submit("held", &released(), false);
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.started().is_empty());
    assert_eq!(h.queue.remaining_jobs(), 1);

    h.queue.set_paused(false);
    let (name, err) = h.next_finished();
    assert_eq!(name, "held");
    assert!(err.is_none());
}

#[test]
fn pause_does_not_preempt_running_job() {
    let h = Harness::new();
    let hold = Arc::new(AtomicBool::new(false));
    h.submit("running", &hold, false);
    h.submit("next", &released(), false);
    wait_until(|| h.started() == ["running"]);

    h.queue.set_paused(true);
    hold.store(true, Ordering::SeqCst);
    assert_eq!(h.next_finished().0, "running");
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.started(), ["running"]);

    h.queue.set_paused(false);
    assert_eq!(h.next_finished().0, "next");
}

#[test]
fn cancel_all_clears_queue() {
    let h = Harness::new();
    let hold = Arc::new(AtomicBool::new(false));
    h.submit("running", &hold, false);
    h.submit("queued", &released(), false);
    wait_until(|| h.started() == ["running"]);

    h.queue.cancel_all_jobs();
    let (name, err) = h.next_finished();
    assert_eq!(name, "running");
    assert!(err.is_some_and(|e| e.is_cancellation()));
    wait_until(|| h.queue.remaining_jobs() == 0);
    assert!(h.finished.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn channel_dispatcher_delivers_callbacks_on_pump() {
    let h = Harness::new();
    let dispatcher = Arc::new(ChannelDispatcher::new());
    h.submit_with("ui", &released(), false, dispatcher.clone());

    wait_until(|| h.queue.remaining_jobs() == 0);
    assert!(h.finished.try_recv().is_err());
    assert_eq!(h.progress_calls.load(Ordering::SeqCst), 0);

    let mut ran = 0;
    while ran < 4 {
        ran += dispatcher.pump_timeout(Duration::from_millis(100));
    }
    assert_eq!(h.progress_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.next_finished().0, "ui");
}

#[test]
fn panicking_job_fails_and_queue_keeps_running() {
    let h = Harness::new();
    h.submit_panicking("broken");
    h.submit("healthy", &released(), false);

    let (name, err) = h.next_finished();
    assert_eq!(name, "broken");
    let err = err.expect("a panic should be reported as an error");
    assert!(matches!(err, DeliveryError::Other(_)));
    assert!(err.to_string().contains("frame source exploded"));

    let (name, err) = h.next_finished();
    assert_eq!(name, "healthy");
    assert!(err.is_none());
    assert_eq!(h.queue.remaining_jobs(), 0);
}

#[test]
fn cancelled_pending_job_no_longer_owns_its_files() {
    let h = Harness::new();
    let hold = Arc::new(AtomicBool::new(false));
    h.submit("running", &hold, false);
    wait_until(|| h.started() == ["running"]);
    let queued = h.submit("queued", &released(), false);
    let frame = Path::new("/renders/queued/frame_000001.png");
    assert!(h.queue.is_rendered_file_of_remaining_job(frame));

    h.queue.cancel_job(queued);
    assert!(!h.queue.is_rendered_file_of_remaining_job(frame));
    assert!(h.queue.is_rendered_file(frame));
    hold.store(true, Ordering::SeqCst);
    assert_eq!(h.next_finished().0, "running");
}
