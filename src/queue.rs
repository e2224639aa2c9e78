use crate::config::Config;
use crate::errors::{JobError, QueueError, ResolutionError};
use crate::expander::Expander;
use crate::jobs::{DownloadTarget, Job, JobState, JobView, Outcome};
use rand::Rng;
use tracing::{Level, event};

const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(300);

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
// Exponential backoff before attempt `retry_count + 1`: `base` doubled for
// every earlier failure, capped at `MAX_BACKOFF`, then stretched by up to 25%
// random jitter so that jobs failing together don't all come back together.
// `ThreadRng` is not `Send`, so it is kept inside this synchronous function.
pub(crate) fn backoff_delay(base: std::time::Duration, retry_count: u32) -> std::time::Duration {
    let exp = retry_count.saturating_sub(1).min(16);
    let delay = base
        .checked_mul(2u32.saturating_pow(exp))
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF);

    let jitter: f64 = rand::rng().random_range(0.0..=0.25);
    delay.mul_f64(1.0 + jitter)
}

#[derive(Clone)]
/// Owns the download queue. All mutations (claim, report, enqueue, purge,
/// cancel) are serialized through one write lock, snapshots take the read
/// lock. Cloning hands out another handle to the same queue.
pub(crate) struct QueueManager {
    jobs: std::sync::Arc<tokio::sync::RwLock<Vec<Job>>>,
    expander: Expander,
    new_work: std::sync::Arc<tokio::sync::Notify>,
    max_retries: u32,
    retry_backoff: std::time::Duration,
}

impl QueueManager {
    pub(crate) fn new(expander: Expander, config: &Config) -> Self {
        Self {
            jobs: std::sync::Arc::new(tokio::sync::RwLock::new(Vec::new())),
            expander,
            new_work: std::sync::Arc::new(tokio::sync::Notify::new()),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Idle workers park on this until a job might have become claimable.
    pub(crate) fn new_work(&self) -> &tokio::sync::Notify {
        &self.new_work
    }

    /// Expand `target` into track jobs and append them in source order.
    /// Returns the IDs of the appended jobs; tracks already in the queue are
    /// not appended a second time.
    pub(crate) async fn enqueue(
        &self,
        target: &DownloadTarget,
    ) -> Result<Vec<String>, ResolutionError> {
        // Catalog lookups happen before taking the lock, so workers keep
        // claiming while a large playlist resolves.
        let expansion = self.expander.expand(target).await?;
        let mut added = Vec::with_capacity(expansion.len());

        {
            let mut jobs = self.jobs.write().await;
            for job in expansion {
                if jobs.iter().any(|j| j.id == job.id) {
                    event!(Level::DEBUG, "Job {} already queued, not adding again", job.id);
                    continue;
                }
                added.push(job.id.clone());
                jobs.push(job);
            }
        }

        event!(
            Level::INFO,
            "Queued {} job(s) for {target}",
            added.len()
        );
        if !added.is_empty() {
            self.new_work.notify_waiters();
        }

        Ok(added)
    }

    /// Claim the earliest pending job whose backoff has elapsed and mark it in
    /// progress for `worker`. At most one caller ever gets a given job, and a
    /// job is passed over while another job writing the same destination is
    /// in progress.
    pub(crate) async fn dequeue_next(&self, worker: usize) -> Option<Job> {
        let now = tokio::time::Instant::now();
        let mut jobs = self.jobs.write().await;
        let busy = busy_destinations(&jobs);
        let job = jobs
            .iter_mut()
            .find(|j| j.is_eligible(now) && !busy.contains(&j.destination))?;

        job.state = JobState::InProgress;
        job.claimed_by = Some(worker);
        job.eligible_at = None;
        job.progress = 0.0;
        Some(job.clone())
    }

    /// How long until some pending job becomes claimable, `None` if no job is
    /// pending or every pending job waits on a busy destination. The latter
    /// are woken through `new_work` once that destination is reported.
    pub(crate) async fn next_eligible_in(&self) -> Option<std::time::Duration> {
        let now = tokio::time::Instant::now();
        let jobs = self.jobs.read().await;
        let busy = busy_destinations(&jobs);
        jobs.iter()
            .filter(|j| j.state == JobState::Pending && !busy.contains(&j.destination))
            .map(|j| {
                j.eligible_at
                    .map_or(std::time::Duration::ZERO, |at| at.saturating_duration_since(now))
            })
            .min()
    }

    /// Record how a worker's attempt at a claimed job ended and return the
    /// job's new state. Transient failures go back to pending with backoff as
    /// long as retry budget remains.
    pub(crate) async fn report_result(
        &self,
        job_id: &str,
        outcome: Outcome,
    ) -> Result<JobState, QueueError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        };
        if job.state != JobState::InProgress {
            return Err(QueueError::NotClaimed(job_id.to_string()));
        }
        job.claimed_by = None;

        match outcome {
            Outcome::Completed(warning) => {
                job.state = JobState::Completed;
                job.progress = 100.0;
                job.last_error = None;
                job.warning = warning.map(|w| w.to_string());
            }
            Outcome::Skipped => {
                job.state = JobState::Skipped;
                job.progress = 100.0;
                job.last_error = None;
            }
            Outcome::Failed(err) => {
                job.retry_count = job.retry_count.saturating_add(1);
                job.progress = 0.0;

                if err.is_transient() && job.retry_count < self.max_retries {
                    let delay = backoff_delay(self.retry_backoff, job.retry_count);
                    event!(
                        Level::INFO,
                        "Attempt {} of at most {} for {} failed ({err}), retrying in {delay:?}",
                        job.retry_count,
                        self.max_retries,
                        job.id,
                    );
                    job.state = JobState::Pending;
                    job.eligible_at = tokio::time::Instant::now().checked_add(delay);
                    job.last_error = Some(err);
                } else {
                    let err = if err.is_transient() {
                        JobError::PermanentFetch(format!(
                            "giving up after {} attempts: {err}",
                            job.retry_count
                        ))
                    } else {
                        err
                    };
                    event!(Level::WARN, "Job {} failed: {err}", job.id);
                    job.state = JobState::Failed;
                    job.last_error = Some(err);
                }
            }
        }

        let state = job.state;
        drop(jobs);
        // Either this job is claimable again or its destination just became
        // free for a job that was waiting on it.
        self.new_work.notify_waiters();

        Ok(state)
    }

    pub(crate) async fn update_progress(&self, job_id: &str, percent: f32) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.state == JobState::InProgress)
        {
            job.progress = percent.clamp(0.0, 100.0);
        }
    }

    /// Hand a claimed job back without charging its retry budget, e.g. when
    /// the pool shuts down mid-download.
    pub(crate) async fn release(&self, job_id: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        };
        if job.state != JobState::InProgress {
            return Err(QueueError::NotClaimed(job_id.to_string()));
        }
        job.state = JobState::Pending;
        job.claimed_by = None;
        job.progress = 0.0;
        drop(jobs);

        self.new_work.notify_one();
        Ok(())
    }

    /// Remove a job that no worker has claimed yet. Returns `false` for jobs
    /// that are in progress, finished or unknown.
    pub(crate) async fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(pos) = jobs
            .iter()
            .position(|j| j.id == job_id && j.state == JobState::Pending)
        else {
            return false;
        };
        jobs.remove(pos);
        event!(Level::INFO, "Cancelled pending job {job_id}");
        true
    }

    pub(crate) async fn snapshot(&self) -> Vec<JobView> {
        self.jobs.read().await.iter().map(JobView::from).collect()
    }

    /// Full copies of all job records, in queue order.
    pub(crate) async fn export(&self) -> Vec<Job> {
        self.jobs.read().await.clone()
    }

    /// Purge jobs in a terminal state, returning how many were removed.
    pub(crate) async fn remove_completed(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|j| !j.state.is_terminal());
        before.saturating_sub(jobs.len())
    }

    /// Drop every job that hasn't been claimed yet.
    pub(crate) async fn clear_pending(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|j| j.state != JobState::Pending);
        before.saturating_sub(jobs.len())
    }

    /// Seed the queue with jobs persisted by an earlier run. Jobs that were in
    /// progress when that run ended become pending again.
    pub(crate) async fn restore(&self, restored: Vec<Job>) -> usize {
        let mut count: usize = 0;
        {
            let mut jobs = self.jobs.write().await;
            for mut job in restored {
                if jobs.iter().any(|j| j.id == job.id) {
                    continue;
                }
                if job.state == JobState::InProgress {
                    job.state = JobState::Pending;
                    job.progress = 0.0;
                }
                job.claimed_by = None;
                job.eligible_at = None;
                jobs.push(job);
                count = count.saturating_add(1);
            }
        }
        if count > 0 {
            self.new_work.notify_waiters();
        }
        count
    }
}

// Destinations currently being written by a claimed job.
fn busy_destinations(jobs: &[Job]) -> std::collections::HashSet<std::path::PathBuf> {
    jobs.iter()
        .filter(|j| j.state == JobState::InProgress)
        .map(|j| j.destination.clone())
        .collect()
}

#[cfg(test)]
pub(crate) fn test_queue(
    catalog: std::sync::Arc<crate::catalog::stub::StubCatalog>,
    config: Config,
) -> QueueManager {
    let config = std::sync::Arc::new(config);
    let expander = Expander::new(catalog, config.clone());
    QueueManager::new(expander, &config)
}
