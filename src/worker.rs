use crate::catalog::{Catalog, TrackStream};
use crate::config::Config;
use crate::errors::JobError;
use crate::jobs::{Job, Outcome};
use crate::queue::QueueManager;
use crate::tagger::Tagger;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};

/// Spaces consecutive stream requests of all workers by at least `delay`, to
/// stay on the good side of the catalog's rate limits.
pub(crate) struct RateLimiter {
    delay: std::time::Duration,
    next_slot: tokio::sync::Mutex<tokio::time::Instant>,
}

impl RateLimiter {
    pub(crate) fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            next_slot: tokio::sync::Mutex::new(tokio::time::Instant::now()),
        }
    }

    // Holding the lock while sleeping makes waiting workers queue up behind
    // each other, one slot each.
    pub(crate) async fn wait(&self) {
        if self.delay.is_zero() {
            return;
        }
        let mut next_slot = self.next_slot.lock().await;
        tokio::time::sleep_until(*next_slot).await;
        let now = tokio::time::Instant::now();
        *next_slot = now.checked_add(self.delay).unwrap_or(now);
    }
}

// How an attempt at fetching a job's audio ended, short of failing.
enum Fetched {
    AlreadyPresent,
    Finalized,
    Interrupted,
}

// Whether the worker should keep claiming jobs.
#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

fn shutdown_requested(recv_shutdown: &mut tokio::sync::broadcast::Receiver<()>) -> bool {
    !matches!(
        recv_shutdown.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    )
}

// A destination counts as downloaded only if it is a non-empty regular file.
// Partial downloads live under a different name and never match.
async fn already_downloaded(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() > 0)
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn percent(written: u64, total: u64) -> f32 {
    ((written as f64 / total as f64) * 100.0) as f32
}

#[derive(Clone)]
/// `WorkerState` aggregates all data that needs to be cloned into each
/// spawned worker task of the pool.
pub(crate) struct WorkerState {
    queue: QueueManager,
    catalog: std::sync::Arc<dyn Catalog>,
    tagger: std::sync::Arc<dyn Tagger>,
    config: std::sync::Arc<Config>,
    rate_limiter: std::sync::Arc<RateLimiter>,
}

impl WorkerState {
    pub(crate) fn new(
        queue: &QueueManager,
        catalog: std::sync::Arc<dyn Catalog>,
        tagger: std::sync::Arc<dyn Tagger>,
        config: std::sync::Arc<Config>,
    ) -> Self {
        let rate_limiter = std::sync::Arc::new(RateLimiter::new(config.rate_limit_delay()));
        Self {
            queue: queue.clone(),
            catalog,
            tagger,
            config,
            rate_limiter,
        }
    }

    // Stream the track's audio into the job's temporary file. Returns `false`
    // if shutdown was signalled before the stream ended.
    async fn write_stream(
        &self,
        job: &Job,
        tmp_path: &std::path::Path,
        mut stream: TrackStream,
        recv_shutdown: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<bool, JobError> {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let total = stream.content_length.filter(|t| *t > 0);
        let mut written: u64 = 0;
        let mut reported: f32 = 0.0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = recv_shutdown.recv() => return Ok(false),
                chunk = stream.chunks.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };

            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written = written.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));

            if let Some(total) = total {
                let pct = percent(written, total);
                if pct - reported >= 1.0 {
                    self.queue.update_progress(&job.id, pct).await;
                    reported = pct;
                }
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(JobError::TransientFetch(format!(
                "catalog sent no audio for track {}",
                job.meta.track_id
            )));
        }

        Ok(true)
    }

    // Fetch the job's audio to a temporary file next to the destination and
    // rename it into place once complete, so the destination path only ever
    // holds whole files.
    async fn fetch(
        &self,
        job: &Job,
        recv_shutdown: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<Fetched, JobError> {
        if self.config.skip_existing && already_downloaded(&job.destination).await {
            return Ok(Fetched::AlreadyPresent);
        }

        if let Some(parent) = job.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::select! {
            _ = recv_shutdown.recv() => return Ok(Fetched::Interrupted),
            () = self.rate_limiter.wait() => {}
        }

        let stream = tokio::select! {
            _ = recv_shutdown.recv() => return Ok(Fetched::Interrupted),
            stream = self.catalog.open_stream(&job.meta.track_id, job.quality) => stream?,
        };

        let tmp_path = job.temp_path();
        match self.write_stream(job, &tmp_path, stream, recv_shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                event!(
                    Level::DEBUG,
                    "Discarded partial download {tmp_path:?} on shutdown"
                );
                return Ok(Fetched::Interrupted);
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        }

        if let Err(e) = tokio::fs::rename(&tmp_path, &job.destination).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        event!(
            Level::DEBUG,
            "Moved download of {} to {:?}",
            job.id,
            job.destination
        );

        Ok(Fetched::Finalized)
    }

    // Store the album cover as a file next to the album's tracks, unless the
    // folder has one already. Problems are logged and never fail the track.
    async fn save_album_art(&self, job: &Job) {
        if !self.config.save_album_art {
            return;
        }
        let (Some(url), Some(folder)) = (job.meta.cover_url.as_deref(), job.destination.parent())
        else {
            return;
        };
        let path = folder.join(&self.config.album_art_filename);
        if already_downloaded(&path).await {
            return;
        }

        let image = match self.catalog.fetch_cover(url).await {
            Ok(image) if !image.is_empty() => image,
            Ok(_) => {
                event!(Level::WARN, "Catalog sent an empty cover for {}", job.id);
                return;
            }
            Err(e) => {
                event!(Level::WARN, "Failed to fetch cover for {}: {e}", job.id);
                return;
            }
        };

        let tmp_path = job.temp_path_for(&path);
        let saved = match tokio::fs::write(&tmp_path, &image).await {
            Ok(()) => tokio::fs::rename(&tmp_path, &path).await,
            Err(e) => Err(e),
        };
        match saved {
            Ok(()) => event!(Level::DEBUG, "Saved album art to {path:?}"),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                event!(Level::WARN, "Failed to save album art to {path:?}: {e}");
            }
        }
    }

    // Run one claimed job through skip check, fetch, finalization and tagging,
    // then report back to the queue.
    async fn process(
        &self,
        worker: usize,
        job: Job,
        recv_shutdown: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Flow {
        event!(
            Level::INFO,
            "Worker {worker} starting attempt {} of at most {} for {} ({} - {})",
            job.retry_count.saturating_add(1),
            self.config.max_retries,
            job.id,
            job.meta.artist,
            job.meta.title,
        );

        let outcome = match self.fetch(&job, recv_shutdown).await {
            Ok(Fetched::AlreadyPresent) => {
                event!(
                    Level::INFO,
                    "Skipping {}, {:?} already exists",
                    job.id,
                    job.destination
                );
                Outcome::Skipped
            }
            Ok(Fetched::Finalized) => {
                let warning = self
                    .tagger
                    .tag(&job.destination, &job.meta, self.config.embed_art)
                    .await
                    .err();
                if let Some(w) = &warning {
                    event!(Level::WARN, "Downloaded {} but {w}", job.id);
                }
                self.save_album_art(&job).await;
                event!(Level::INFO, "Successfully completed download job {}", job.id);
                Outcome::Completed(warning)
            }
            Ok(Fetched::Interrupted) => {
                if let Err(e) = self.queue.release(&job.id).await {
                    event!(Level::WARN, "Failed to release {} on shutdown: {e}", job.id);
                }
                return Flow::Shutdown;
            }
            Err(e) => Outcome::Failed(e),
        };

        if let Err(e) = self.queue.report_result(&job.id, outcome).await {
            event!(Level::WARN, "Worker {worker} failed to report result: {e}");
        }

        Flow::Continue
    }

    async fn work(self, worker: usize, mut recv_shutdown: tokio::sync::broadcast::Receiver<()>) {
        event!(Level::DEBUG, "Worker {worker} started");
        let poll_interval = self.config.poll_interval();

        loop {
            if shutdown_requested(&mut recv_shutdown) {
                break;
            }

            // Register for wake-ups before looking for work, so a job queued
            // right after an empty claim isn't missed.
            let notified = self.queue.new_work().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.queue.dequeue_next(worker).await {
                if self.process(worker, job, &mut recv_shutdown).await == Flow::Shutdown {
                    break;
                }
                continue;
            }

            let wait = self
                .queue
                .next_eligible_in()
                .await
                .map_or(poll_interval, |d| d.min(poll_interval));

            tokio::select! {
                _ = recv_shutdown.recv() => break,
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }

        event!(Level::DEBUG, "Worker {worker} shutting down...");
    }

    /// Run `max_parallel` workers until shutdown is signalled, i.e. until the
    /// sender half of `recv_shutdown`'s channel is dropped.
    pub(crate) async fn run(self, recv_shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut set = tokio::task::JoinSet::new();
        for worker in 0..self.config.max_parallel {
            set.spawn(self.clone().work(worker, recv_shutdown.resubscribe()));
        }
        drop(recv_shutdown);
        event!(
            Level::INFO,
            "Started {} download workers",
            self.config.max_parallel
        );

        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                event!(Level::WARN, "Worker task ended abnormally: {e}");
            }
        }
        event!(Level::DEBUG, "Worker pool shut down");
    }
}
