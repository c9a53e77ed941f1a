//! Fixed-size pool of copy workers draining a shared, bounded job queue.
//!
//! Worker lifecycle:
//!
//! ```text
//! Idle --(dequeue job)--> Copying --(success)--> Idle
//!                            |
//!                        (failure)--> Reporting --> Terminated
//! Idle --(queue closed and empty, or cancelled)--> Terminated
//! ```
//!
//! A failing worker reports to the error collector and exits; the remaining workers keep
//! draining the queue. The collector is a channel with one slot per worker and every worker
//! reports at most once, so reporting never blocks.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::progress;
use crate::replicate::Summary;
use crate::transfer;

/// One file to copy. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    pub src: std::path::PathBuf,
    pub dst: std::path::PathBuf,
}

/// The copy step a worker runs for each job; returns the number of bytes copied.
pub trait Copier: Send + Sync + 'static {
    fn copy(
        &self,
        job: &CopyJob,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// Copies jobs with [`transfer::copy_chunked`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkedCopier {
    pub chunk_size: usize,
}

impl Copier for ChunkedCopier {
    async fn copy(&self, job: &CopyJob, cancel: &CancellationToken) -> Result<u64, Error> {
        transfer::copy_chunked(&job.src, &job.dst, self.chunk_size, cancel, None).await
    }
}

/// What the pool reports once every worker has exited.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub summary: Summary,
    /// Worker failures in the order they were reported
    pub failures: Vec<Error>,
}

pub struct WorkerPool {
    jobs: async_channel::Sender<CopyJob>,
    errors: tokio::sync::mpsc::Receiver<Error>,
    workers: tokio::task::JoinSet<Summary>,
    prog_track: &'static progress::Progress,
}

impl WorkerPool {
    /// Spawn `workers` workers sharing a queue of `queue_capacity` jobs.
    pub fn start<C: Copier>(
        workers: usize,
        queue_capacity: usize,
        copier: C,
        prog_track: &'static progress::Progress,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        if workers == 0 {
            return Err(Error::InvalidConfiguration(
                "worker count must be greater than 0".to_string(),
            ));
        }
        if queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        let (job_tx, job_rx) = async_channel::bounded(queue_capacity);
        let (error_tx, error_rx) = tokio::sync::mpsc::channel(workers);
        let copier = Arc::new(copier);
        let mut join_set = tokio::task::JoinSet::new();
        for id in 1..=workers {
            join_set.spawn(worker(
                id,
                copier.clone(),
                job_rx.clone(),
                error_tx.clone(),
                prog_track,
                cancel.clone(),
            ));
        }
        tracing::debug!("started {} workers, queue capacity {}", workers, queue_capacity);
        Ok(Self {
            jobs: job_tx,
            errors: error_rx,
            workers: join_set,
            prog_track,
        })
    }

    /// Enqueue a job, waiting while the queue is full.
    ///
    /// Fails with [`Error::QueueClosedPrematurely`] once every worker has terminated.
    pub async fn submit(&self, job: CopyJob) -> Result<(), Error> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| Error::QueueClosedPrematurely)?;
        self.prog_track.jobs_submitted.inc();
        Ok(())
    }

    /// Close the queue and wait for every worker to exit.
    pub async fn finish(mut self) -> PoolOutcome {
        self.jobs.close();
        let mut outcome = PoolOutcome::default();
        let mut task_failures = Vec::new();
        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(summary) => outcome.summary = outcome.summary + summary,
                Err(error) => {
                    tracing::error!("worker task failed: {}", &error);
                    task_failures.push(Error::from(error));
                }
            }
        }
        while let Ok(error) = self.errors.try_recv() {
            outcome.failures.push(error);
        }
        outcome.failures.extend(task_failures);
        outcome
    }
}

#[instrument(skip(copier, jobs, errors, prog_track, cancel))]
async fn worker<C: Copier>(
    id: usize,
    copier: Arc<C>,
    jobs: async_channel::Receiver<CopyJob>,
    errors: tokio::sync::mpsc::Sender<Error>,
    prog_track: &'static progress::Progress,
    cancel: CancellationToken,
) -> Summary {
    let mut summary = Summary::default();
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("cancelled while idle");
                break;
            }
            job = jobs.recv() => match job {
                Ok(job) => job,
                // closed and drained
                Err(_) => break,
            },
        };
        let _ops_guard = prog_track.ops.guard();
        tracing::trace!("copying {:?} -> {:?}", &job.src, &job.dst);
        match copier.copy(&job, &cancel).await {
            Ok(bytes) => {
                prog_track.files_copied.inc();
                prog_track.bytes_copied.add(bytes);
                summary.files_copied += 1;
                summary.bytes_copied += bytes;
            }
            Err(Error::Cancelled) => {
                tracing::debug!("cancelled while copying {:?}", &job.src);
                break;
            }
            Err(error) => {
                tracing::error!(
                    "worker {} failed copying {:?} -> {:?}: {:#}",
                    id,
                    &job.src,
                    &job.dst,
                    &error
                );
                prog_track.files_failed.inc();
                summary.files_failed += 1;
                if let Err(error) = errors.try_send(error) {
                    tracing::error!("failed reporting worker error: {}", &error);
                }
                break;
            }
        }
    }
    tracing::debug!("worker exiting");
    summary
}
