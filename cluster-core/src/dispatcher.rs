//! Bounded worker pool
//!
//! Jobs are queued through the pool handle into a bounded channel and
//! handed to the next idle worker, so submission exerts backpressure
//! when all workers are busy and the queue is full. Jobs run in FIFO
//! order and may report their error on a caller-supplied channel.

use std::error::Error;
use thiserror::Error as ThisError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Jobs admitted beyond the busy workers before `submit` blocks.
pub const MAX_QUEUE: usize = 100;

pub type JobError = Box<dyn Error + Send + Sync>;

#[derive(Debug, ThisError)]
pub enum DispatcherError {
    #[error("dispatcher is shut down")]
    ShutDown,
}

/// A unit of work with an optional error back-channel.
pub struct Job {
    work: Box<dyn FnOnce() -> Result<(), JobError> + Send>,
    errors: Option<mpsc::UnboundedSender<JobError>>,
}

impl Job {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<(), JobError> + Send + 'static,
    {
        Self {
            work: Box::new(work),
            errors: None,
        }
    }

    /// Failures are pushed onto `errors` instead of being logged.
    pub fn with_errors<F>(work: F, errors: mpsc::UnboundedSender<JobError>) -> Self
    where
        F: FnOnce() -> Result<(), JobError> + Send + 'static,
    {
        Self {
            work: Box::new(work),
            errors: Some(errors),
        }
    }

    fn run(self) {
        if let Err(err) = (self.work)() {
            match self.errors {
                Some(errors) => {
                    let _ = errors.send(err);
                }
                None => warn!(error = %err, "job failed"),
            }
        }
    }
}

/// Handle to the pool. Cloneable; the pool stops when `shutdown` is
/// called.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: mpsc::Sender<Job>,
    quit: broadcast::Sender<()>,
}

impl Dispatcher {
    /// Spawn `workers` workers and the dispatch loop.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<Job>(MAX_QUEUE);
        let (quit_tx, _) = broadcast::channel::<()>(1);

        // Workers park their job sender here when ready for work.
        let (idle_tx, mut idle_rx) = mpsc::channel::<mpsc::Sender<Job>>(workers);

        for id in 0..workers {
            spawn_worker(id, idle_tx.clone(), quit_tx.subscribe());
        }

        let mut quit_rx = quit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    job = jobs_rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    _ = quit_rx.recv() => break,
                };
                // Wait for an idle worker before pulling the next job.
                let worker = tokio::select! {
                    worker = idle_rx.recv() => match worker {
                        Some(worker) => worker,
                        None => break,
                    },
                    _ = quit_rx.recv() => break,
                };
                if worker.send(job).await.is_err() {
                    break;
                }
            }
            debug!("dispatch loop stopped");
        });

        info!(workers, "worker pool started");
        Self {
            jobs: jobs_tx,
            quit: quit_tx,
        }
    }

    /// Queue a job. Blocks while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), DispatcherError> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| DispatcherError::ShutDown)
    }

    /// Queue a job without waiting. The job is returned when the queue
    /// is full.
    pub fn try_submit(&self, job: Job) -> Result<(), Option<Job>> {
        self.jobs.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(job) => Some(job),
            mpsc::error::TrySendError::Closed(_) => None,
        })
    }

    /// Stop the workers. Queued jobs not yet handed out are dropped.
    pub fn shutdown(&self) {
        let _ = self.quit.send(());
    }
}

fn spawn_worker(
    id: usize,
    idle: mpsc::Sender<mpsc::Sender<Job>>,
    mut quit: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (job_tx, mut job_rx) = mpsc::channel::<Job>(1);
        loop {
            if idle.send(job_tx.clone()).await.is_err() {
                break;
            }
            tokio::select! {
                job = job_rx.recv() => match job {
                    Some(job) => job.run(),
                    None => break,
                },
                _ = quit.recv() => break,
            }
        }
        debug!(worker = id, "worker stopped");
    })
}
