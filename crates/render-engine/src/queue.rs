//! Serial render queue.
//!
//! One named worker thread takes submitted jobs in FIFO order. Callbacks are
//! handed to the caller's [`Dispatcher`] so they can run on a UI loop.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use reelout_common::{CancelFlag, DeliveryError, DeliveryResult, CANCEL_POLL_INTERVAL};

use crate::job::{RenderJob, MAX_RENDER_PROGRESS};

pub type JobId = u64;

pub type ProgressCallback = Arc<dyn Fn(u32) + Send + Sync>;
pub type FinishCallback = Box<dyn FnOnce(Option<DeliveryError>) + Send>;

pub type Task = Box<dyn FnOnce() + Send>;

/// Runs callbacks on the caller's behalf.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task);
}

/// Runs callbacks on the queue's worker thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, task: Task) {
        task();
    }
}

/// Collects callbacks until the owning loop pumps them.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl ChannelDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Run every callback queued so far. Returns how many ran.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one callback, then pump the rest.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }
}

impl Default for ChannelDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, task: Task) {
        // The receiver lives as long as `self`.
        let _ = self.tx.send(task);
    }
}

struct SubmittedJob {
    id: JobId,
    job: Box<dyn RenderJob>,
    dispatcher: Arc<dyn Dispatcher>,
    on_progress: ProgressCallback,
    on_finish: FinishCallback,
    cancel: CancelFlag,
}

/// The job taken off the queue, waiting at the pause gate or rendering.
struct CurrentJob {
    id: JobId,
    destination: PathBuf,
    cancel: CancelFlag,
    started: bool,
}

#[derive(Default)]
struct State {
    pending: VecDeque<SubmittedJob>,
    current: Option<CurrentJob>,
    paused: bool,
    shutdown: bool,
    next_id: JobId,
    history: Vec<PathBuf>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct RenderQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RenderQueue {
    /// Spawn the worker thread.
    pub fn start() -> DeliveryResult<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("render-queue".into())
            .spawn(move || worker_loop(&worker_shared))?;
        tracing::debug!("Render queue started");
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Enqueue `job`. Never blocks on running work.
    pub fn submit_job(
        &self,
        job: Box<dyn RenderJob>,
        dispatcher: Arc<dyn Dispatcher>,
        on_progress: ProgressCallback,
        on_finish: FinishCallback,
    ) -> JobId {
        let mut state = self.shared.lock();
        state.next_id += 1;
        let id = state.next_id;
        let destination = job.destination().to_path_buf();
        tracing::info!(job = id, destination = %destination.display(), "Render job submitted");
        state.history.push(destination);
        state.pending.push_back(SubmittedJob {
            id,
            job,
            dispatcher,
            on_progress,
            on_finish,
            cancel: CancelFlag::new(),
        });
        drop(state);
        self.shared.wake.notify_all();
        id
    }

    /// Cancel a job. A job that has not started is skipped without callbacks;
    /// a running job is interrupted and finishes with `Cancelled`.
    pub fn cancel_job(&self, id: JobId) {
        let state = self.shared.lock();
        if let Some(current) = state.current.as_ref().filter(|c| c.id == id) {
            tracing::info!(job = id, running = current.started, "Cancelling render job");
            current.cancel.cancel();
        } else if let Some(job) = state.pending.iter().find(|j| j.id == id) {
            tracing::info!(job = id, running = false, "Cancelling render job");
            job.cancel.cancel();
        }
        drop(state);
        self.shared.wake.notify_all();
    }

    pub fn cancel_all_jobs(&self) {
        let state = self.shared.lock();
        for job in &state.pending {
            job.cancel.cancel();
        }
        if let Some(current) = &state.current {
            current.cancel.cancel();
        }
        drop(state);
        self.shared.wake.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Hold jobs before they start. A running job is never preempted.
    pub fn set_paused(&self, paused: bool) {
        self.shared.lock().paused = paused;
        self.shared.wake.notify_all();
    }

    /// Jobs submitted but not finished, excluding ones cancelled before start.
    pub fn remaining_jobs(&self) -> usize {
        let state = self.shared.lock();
        let pending = state
            .pending
            .iter()
            .filter(|j| !j.cancel.is_cancelled())
            .count();
        let current = state
            .current
            .as_ref()
            .filter(|c| c.started || !c.cancel.is_cancelled())
            .is_some();
        pending + usize::from(current)
    }

    /// Whether `path` lies inside the destination of a job that has not finished.
    pub fn is_rendered_file_of_remaining_job(&self, path: &Path) -> bool {
        let state = self.shared.lock();
        state
            .current
            .iter()
            .filter(|c| c.started || !c.cancel.is_cancelled())
            .map(|c| c.destination.as_path())
            .chain(
                state
                    .pending
                    .iter()
                    .filter(|j| !j.cancel.is_cancelled())
                    .map(|j| j.job.destination()),
            )
            .any(|dest| path.starts_with(dest))
    }

    /// Whether `path` lies inside the destination of any job ever submitted.
    pub fn is_rendered_file(&self, path: &Path) -> bool {
        self.shared.lock().history.iter().any(|dest| path.starts_with(dest))
    }

    /// Cancel everything and join the worker. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            for job in &state.pending {
                job.cancel.cancel();
            }
            if let Some(current) = &state.current {
                current.cancel.cancel();
            }
        }
        self.shared.wake.notify_all();
        if worker.join().is_err() {
            tracing::error!("Render queue worker panicked");
        }
        tracing::debug!("Render queue stopped");
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Take the next job and hold it at the pause gate. `None` on shutdown.
fn take_next(shared: &Shared) -> Option<SubmittedJob> {
    let mut state = shared.lock();
    let job = loop {
        if state.shutdown {
            return None;
        }
        if let Some(job) = state.pending.pop_front() {
            break job;
        }
        state = shared
            .wake
            .wait(state)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    };
    state.current = Some(CurrentJob {
        id: job.id,
        destination: job.job.destination().to_path_buf(),
        cancel: job.cancel.clone(),
        started: false,
    });

    while state.paused && !state.shutdown && !job.cancel.is_cancelled() {
        state = shared
            .wake
            .wait_timeout(state, CANCEL_POLL_INTERVAL)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }

    if state.shutdown || job.cancel.is_cancelled() {
        tracing::debug!(job = job.id, "Skipping render job cancelled before start");
        state.current = None;
        return Some(job);
    }
    if let Some(current) = state.current.as_mut() {
        current.started = true;
    }
    Some(job)
}

fn worker_loop(shared: &Shared) {
    while let Some(submitted) = take_next(shared) {
        if submitted.cancel.is_cancelled() {
            continue;
        }
        run_job(shared, submitted);
    }
}

fn run_job(shared: &Shared, submitted: SubmittedJob) {
    let SubmittedJob {
        id,
        job,
        dispatcher,
        on_progress,
        on_finish,
        cancel,
    } = submitted;

    tracing::info!(job = id, destination = %job.destination().display(), "Render job started");
    let report = {
        let dispatcher = Arc::clone(&dispatcher);
        move |value: u32| {
            let on_progress = Arc::clone(&on_progress);
            dispatcher.dispatch(Box::new(move || on_progress(value)));
        }
    };
    report(0);
    let result = panic::catch_unwind(AssertUnwindSafe(|| job.render(&report, &cancel)))
        .unwrap_or_else(|payload| {
            Err(DeliveryError::other(format!(
                "render job panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    shared.lock().current = None;

    match result {
        Ok(()) => {
            tracing::info!(job = id, "Render job finished");
            report(MAX_RENDER_PROGRESS);
            dispatcher.dispatch(Box::new(move || on_finish(None)));
        }
        Err(err) => {
            if err.is_cancellation() {
                tracing::info!(job = id, "Render job cancelled");
            } else {
                tracing::error!(job = id, error = %err, "Render job failed");
            }
            dispatcher.dispatch(Box::new(move || on_finish(Some(err))));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct SleepJob {
        destination: PathBuf,
        started: Arc<AtomicBool>,
    }

    impl RenderJob for SleepJob {
        fn destination(&self) -> &Path {
            &self.destination
        }

        fn render(&self, progress: &crate::job::ProgressFn, cancel: &CancelFlag) -> DeliveryResult<()> {
            self.started.store(true, Ordering::SeqCst);
            for step in 1..=50 {
                cancel.check()?;
                std::thread::sleep(Duration::from_millis(2));
                progress(step * 100);
            }
            Ok(())
        }
    }

    fn sleep_job(dest: &str) -> (Box<dyn RenderJob>, Arc<AtomicBool>) {
        let started = Arc::new(AtomicBool::new(false));
        let job = SleepJob {
            destination: PathBuf::from(dest),
            started: Arc::clone(&started),
        };
        (Box::new(job), started)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_channel_dispatcher_defers_until_pumped() {
        let dispatcher = ChannelDispatcher::new();
        let hit = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&hit);
        dispatcher.dispatch(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!hit.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pump(), 1);
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pump_timeout(Duration::from_millis(5)), 0);
    }

    #[test]
    fn test_rendered_file_tracking() {
        let queue = RenderQueue::start().unwrap();
        queue.set_paused(true);
        let (job, _) = sleep_job("/tmp/reelout-queue/seq");
        let id = queue.submit_job(
            job,
            Arc::new(ImmediateDispatcher),
            Arc::new(|_: u32| {}),
            Box::new(|_: Option<DeliveryError>| {}),
        );
        let inside = Path::new("/tmp/reelout-queue/seq/frame_000001.png");
        assert!(queue.is_rendered_file_of_remaining_job(inside));
        assert!(queue.is_rendered_file(inside));
        assert!(!queue.is_rendered_file(Path::new("/tmp/other.png")));
        assert_eq!(queue.remaining_jobs(), 1);

        queue.cancel_job(id);
        wait_until(|| queue.remaining_jobs() == 0);
        wait_until(|| !queue.is_rendered_file_of_remaining_job(inside));
        assert!(queue.is_rendered_file(inside));
    }

    #[test]
    fn test_shutdown_interrupts_running_job() {
        let mut queue = RenderQueue::start().unwrap();
        let (job, started) = sleep_job("/tmp/reelout-queue/a.mov");
        let (tx, rx) = crossbeam::channel::bounded(1);
        queue.submit_job(
            job,
            Arc::new(ImmediateDispatcher),
            Arc::new(|_: u32| {}),
            Box::new(move |err: Option<DeliveryError>| {
                let _ = tx.send(err);
            }),
        );
        wait_until(|| started.load(Ordering::SeqCst));
        queue.shutdown();
        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(err.is_some_and(|e| e.is_cancellation()));
        queue.shutdown();
    }
}
