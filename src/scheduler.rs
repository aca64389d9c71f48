//! Bounded-concurrency background job runner.
//!
//! Reindex, migrate, merge and index-build work runs here: a fixed pool of
//! worker threads drains a job queue, so at most `max_concurrent_jobs`
//! jobs execute at once no matter how many are submitted. Each job gets a
//! progress handle (chunks/records done, error details) and a cancellation
//! token; cancellation is cooperative, checked by the job body at chunk
//! boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::tools::sync::lock;
use crate::{Error, Result};

/// Cooperative cancellation flag, shared between a job (or query) and its
/// caller. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Error out of the current operation if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Terminal and non-terminal states of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Queued | JobState::Running)
    }
}

/// Live progress of a job. Updated by the job body, read by anyone holding
/// the handle.
pub struct JobProgress {
    chunks_total: AtomicU64,
    chunks_done: AtomicU64,
    records_done: AtomicU64,
    errors: Mutex<Vec<String>>,
    state: Mutex<JobState>,
    state_changed: Condvar,
}

impl JobProgress {
    fn new() -> JobProgress {
        JobProgress {
            chunks_total: AtomicU64::new(0),
            chunks_done: AtomicU64::new(0),
            records_done: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            state: Mutex::new(JobState::Queued),
            state_changed: Condvar::new(),
        }
    }

    pub fn set_chunks_total(&self, n: u64) {
        self.chunks_total.store(n, Ordering::Relaxed);
    }

    pub fn chunk_done(&self) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records_done(&self, n: u64) {
        self.records_done.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a recoverable error; the job keeps running.
    pub fn error(&self, detail: impl Into<String>) {
        let detail = detail.into();
        warn!("job error detail: {}", detail);
        lock(&self.errors).push(detail);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            chunks_done: self.chunks_done.load(Ordering::Relaxed),
            records_done: self.records_done.load(Ordering::Relaxed),
            errors: lock(&self.errors).clone(),
            state: lock(&self.state).clone(),
        }
    }

    fn set_state(&self, state: JobState) {
        *lock(&self.state) = state;
        self.state_changed.notify_all();
    }

    fn wait_terminal(&self) -> JobState {
        let mut state = lock(&self.state);
        while !state.is_terminal() {
            state = self
                .state_changed
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        state.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub chunks_total: u64,
    pub chunks_done: u64,
    pub records_done: u64,
    pub errors: Vec<String>,
    pub state: JobState,
}

/// Handle to a submitted job: progress, cancellation, blocking wait.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    kind: String,
    progress: Arc<JobProgress>,
    cancel: CancelToken,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the job reaches a terminal state.
    pub fn wait(&self) -> JobState {
        self.progress.wait_terminal()
    }
}

/// What a job body gets to work with.
pub struct JobCtx {
    pub progress: Arc<JobProgress>,
    pub cancel: CancelToken,
}

type JobFn = Box<dyn FnOnce(&JobCtx) -> Result<()> + Send + 'static>;

struct QueuedJob {
    id: Uuid,
    kind: String,
    ctx: JobCtx,
    body: JobFn,
}

/// The worker pool. Dropping the scheduler stops accepting jobs, lets the
/// workers drain the queue and joins them.
pub struct Scheduler {
    tx: Mutex<Option<Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    jobs: Mutex<HashMap<Uuid, JobHandle>>,
}

impl Scheduler {
    pub fn new(max_concurrent_jobs: usize) -> Scheduler {
        let (tx, rx) = unbounded::<QueuedJob>();
        let workers = (0..max_concurrent_jobs.max(1))
            .map(|n| {
                let rx: Receiver<QueuedJob> = rx.clone();
                std::thread::Builder::new()
                    .name(format!("job-worker-{}", n))
                    .spawn(move || worker_loop(rx))
                    .expect("spawn job worker")
            })
            .collect();

        Scheduler {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a job. It starts as soon as a worker is free.
    pub fn submit<F>(&self, kind: &str, body: F) -> Result<JobHandle>
    where
        F: FnOnce(&JobCtx) -> Result<()> + Send + 'static,
    {
        let id = Uuid::now_v7();
        let progress = Arc::new(JobProgress::new());
        let cancel = CancelToken::new();
        let handle = JobHandle {
            id,
            kind: kind.to_owned(),
            progress: progress.clone(),
            cancel: cancel.clone(),
        };

        let job = QueuedJob {
            id,
            kind: kind.to_owned(),
            ctx: JobCtx { progress, cancel },
            body: Box::new(body),
        };

        let guard = lock(&self.tx);
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::precondition("scheduler is shut down"))?;
        tx.send(job)
            .map_err(|_| Error::precondition("scheduler is shut down"))?;

        lock(&self.jobs).insert(id, handle.clone());
        debug!("queued {} job {}", kind, id);
        Ok(handle)
    }

    pub fn job(&self, id: Uuid) -> Option<JobHandle> {
        lock(&self.jobs).get(&id).cloned()
    }

    /// Handles of all known jobs (including finished ones).
    pub fn jobs(&self) -> Vec<JobHandle> {
        lock(&self.jobs).values().cloned().collect()
    }

    /// Stop accepting new jobs, drain the queue and join the workers.
    pub fn shutdown(&self) {
        let tx = lock(&self.tx).take();
        drop(tx);
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<QueuedJob>) {
    while let Ok(job) = rx.recv() {
        if job.ctx.cancel.is_cancelled() {
            job.ctx.progress.set_state(JobState::Cancelled);
            continue;
        }
        job.ctx.progress.set_state(JobState::Running);
        info!("job {} ({}) started", job.id, job.kind);

        let result = (job.body)(&job.ctx);
        let state = match result {
            Ok(()) => JobState::Finished,
            Err(Error::Cancelled) => JobState::Cancelled,
            Err(err) => JobState::Failed(err.to_string()),
        };
        info!("job {} ({}) ended: {:?}", job.id, job.kind, state);
        job.ctx.progress.set_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn jobs_run_and_finish() {
        let scheduler = Scheduler::new(2);
        let handle = scheduler
            .submit("test", |ctx| {
                ctx.progress.set_chunks_total(1);
                ctx.progress.chunk_done();
                ctx.progress.records_done(10);
                Ok(())
            })
            .unwrap();

        assert_eq!(handle.wait(), JobState::Finished);
        let snap = handle.progress();
        assert_eq!(snap.chunks_done, 1);
        assert_eq!(snap.records_done, 10);
        assert!(snap.errors.is_empty());
    }

    #[test]
    fn failures_carry_the_message() {
        let scheduler = Scheduler::new(1);
        let handle = scheduler
            .submit("test", |_| Err(Error::internal("boom")))
            .unwrap();
        match handle.wait() {
            JobState::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn cancellation_is_observed() {
        let scheduler = Scheduler::new(1);
        let handle = scheduler
            .submit("test", |ctx| {
                for _ in 0..1000 {
                    ctx.cancel.check()?;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap();

        handle.cancel();
        assert_eq!(handle.wait(), JobState::Cancelled);
    }

    #[test]
    fn recoverable_errors_do_not_fail_the_job() {
        let scheduler = Scheduler::new(1);
        let handle = scheduler
            .submit("test", |ctx| {
                ctx.progress.error("chunk 1: bad");
                Ok(())
            })
            .unwrap();
        assert_eq!(handle.wait(), JobState::Finished);
        assert_eq!(handle.progress().errors.len(), 1);
    }

    #[test]
    fn concurrency_is_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let scheduler = Scheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                scheduler
                    .submit("test", move |_| {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.wait(), JobState::Finished);
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
