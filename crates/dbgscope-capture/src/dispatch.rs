//! Job dispatchers
//!
//! [`BackgroundDispatcher`] runs jobs in order on one dedicated thread and
//! supports `flush`. [`OnDemandDispatcher`] only queues; its owner runs the
//! queued jobs on its own thread with `execute_queued_jobs`.
//!
//! A job that returns an error or panics is reported as a [`JobFailure`] on
//! the failure channel and dispatching continues with the next job.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{broadcast, oneshot};

use crate::error::{CaptureError, Result};

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

const FAILURE_CHANNEL_CAPACITY: usize = 64;

/// Report of a job that failed or panicked
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFailure {
    /// Name of the dispatcher that ran the job
    pub dispatcher: String,
    pub message: String,
    pub panicked: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

fn run_job(dispatcher: &str, job: Job, failures: &broadcast::Sender<JobFailure>) {
    let failure = match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => JobFailure {
            dispatcher: dispatcher.to_string(),
            message: format!("{e:#}"),
            panicked: false,
        },
        Err(payload) => JobFailure {
            dispatcher: dispatcher.to_string(),
            message: panic_message(payload.as_ref()),
            panicked: true,
        },
    };

    tracing::warn!(dispatcher, panicked = failure.panicked, "job failed: {}", failure.message);
    // No subscribers is fine
    let _ = failures.send(failure);
}

// ============================================================================
// Background dispatcher
// ============================================================================

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    name: String,
    queue: Mutex<Queue>,
    available: Condvar,
    failures: broadcast::Sender<JobFailure>,
}

/// Runs queued jobs in order on one dedicated thread
pub struct BackgroundDispatcher {
    shared: Arc<Shared>,
    worker_id: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundDispatcher {
    pub fn new(name: &str) -> Result<Self> {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            name: name.to_string(),
            queue: Mutex::new(Queue::default()),
            available: Condvar::new(),
            failures,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || worker_loop(&shared))
                .map_err(|e| CaptureError::os("spawn dispatcher thread", e))?
        };

        Ok(Self {
            shared,
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job` behind everything already queued
    pub fn queue<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(CaptureError::DispatcherStopped);
        }
        queue.jobs.push_back(Box::new(job));
        self.shared.available.notify_one();
        Ok(())
    }

    /// Wait until every job queued before this call has run
    ///
    /// Jobs queued by those jobs while they run are not waited for.
    ///
    /// # Panics
    ///
    /// Blocks the calling thread, so it panics when called from within an
    /// asynchronous execution context.
    pub fn flush(&self) -> Result<()> {
        if std::thread::current().id() == self.worker_id {
            return Err(CaptureError::FlushFromDispatcher);
        }

        let (done, finished) = oneshot::channel::<()>();
        self.queue(move || {
            // The flusher may have given up waiting
            let _ = done.send(());
            Ok(())
        })?;
        // A closed channel means the barrier was discarded by `stop_now`
        finished.blocking_recv().map_err(|_| CaptureError::DispatcherStopped)
    }

    /// Number of jobs waiting to run
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<JobFailure> {
        self.shared.failures.subscribe()
    }

    /// Run the remaining jobs, then stop the thread; idempotent
    pub fn stop(&self) {
        self.shared.queue.lock().stopping = true;
        self.shared.available.notify_all();
        self.join();
    }

    /// Discard pending jobs and stop; returns how many were discarded
    pub fn stop_now(&self) -> usize {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
            let jobs = std::mem::take(&mut queue.jobs);
            jobs.len()
        };
        self.shared.available.notify_all();
        if discarded > 0 {
            tracing::warn!(dispatcher = %self.shared.name, discarded, "discarded pending jobs");
        }
        self.join();
        discarded
    }

    fn join(&self) {
        // A job stopping its own dispatcher cannot join itself
        if std::thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::warn!(dispatcher = %self.shared.name, "dispatcher thread panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.stopping {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };

        match job {
            Some(job) => run_job(&shared.name, job, &shared.failures),
            None => break,
        }
    }
    tracing::debug!(dispatcher = %shared.name, "dispatcher stopped");
}

impl Drop for BackgroundDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// On-demand dispatcher
// ============================================================================

/// Queues jobs for the owner to run on its own thread
pub struct OnDemandDispatcher {
    name: String,
    jobs: Mutex<VecDeque<Job>>,
    queued: broadcast::Sender<()>,
    failures: broadcast::Sender<JobFailure>,
}

impl OnDemandDispatcher {
    pub fn new(name: &str) -> Self {
        let (queued, _) = broadcast::channel(16);
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            jobs: Mutex::new(VecDeque::new()),
            queued,
            failures,
        }
    }

    /// Store `job` and publish a job-queued notification
    pub fn queue<F>(&self, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.jobs.lock().push_back(Box::new(job));
        let _ = self.queued.send(());
    }

    /// Run every job queued so far on the calling thread; returns how many ran
    ///
    /// Jobs queued while this runs wait for the next call.
    pub fn execute_queued_jobs(&self) -> usize {
        let jobs = std::mem::take(&mut *self.jobs.lock());
        let count = jobs.len();
        for job in jobs {
            run_job(&self.name, job, &self.failures);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Notified once per queued job
    pub fn subscribe_queued(&self) -> broadcast::Receiver<()> {
        self.queued.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<JobFailure> {
        self.failures.subscribe()
    }
}
