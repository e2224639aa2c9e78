use crate::jobs::{JobState, JobView};
use crate::queue::QueueManager;
use tracing::{Level, event};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
/// Number of jobs per state at the time of one snapshot.
pub(crate) struct QueueSummary {
    pub(crate) pending: usize,
    pub(crate) in_progress: usize,
    pub(crate) completed: usize,
    pub(crate) failed: usize,
    pub(crate) skipped: usize,
    pub(crate) total: usize,
}

impl QueueSummary {
    pub(crate) fn from_snapshot(jobs: &[JobView]) -> Self {
        let mut summary = QueueSummary {
            total: jobs.len(),
            ..QueueSummary::default()
        };
        for job in jobs {
            let count = match job.state {
                JobState::Pending => &mut summary.pending,
                JobState::InProgress => &mut summary.in_progress,
                JobState::Completed => &mut summary.completed,
                JobState::Failed => &mut summary.failed,
                JobState::Skipped => &mut summary.skipped,
            };
            *count = count.saturating_add(1);
        }
        summary
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

impl std::fmt::Display for QueueSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(
            f,
            "{} pending, {} in progress, {} completed, {} failed, {} skipped ({} total)",
            self.pending, self.in_progress, self.completed, self.failed, self.skipped, self.total
        )
    }
}

#[derive(Clone)]
/// Read-only observer of the queue. Never changes a job.
pub(crate) struct ProgressReporter {
    queue: QueueManager,
}

impl ProgressReporter {
    pub(crate) fn new(queue: &QueueManager) -> Self {
        Self {
            queue: queue.clone(),
        }
    }

    pub(crate) async fn summary(&self) -> QueueSummary {
        QueueSummary::from_snapshot(&self.queue.snapshot().await)
    }

    pub(crate) async fn details(&self) -> Vec<JobView> {
        self.queue.snapshot().await
    }

    /// Summary and per-job details taken from the same snapshot.
    pub(crate) async fn report(&self) -> (QueueSummary, Vec<JobView>) {
        let jobs = self.details().await;
        (QueueSummary::from_snapshot(&jobs), jobs)
    }

    /// Log a summary line every `interval` in which the counts changed, plus
    /// the progress of every running download at DEBUG level.
    pub(crate) async fn run(
        self,
        interval: std::time::Duration,
        mut recv_shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = QueueSummary::default();

        loop {
            tokio::select! {
                _ = recv_shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            let (summary, jobs) = self.report().await;
            if summary != last {
                event!(Level::INFO, "Queue: {summary}");
                if summary.is_idle() && summary.total > 0 {
                    event!(Level::INFO, "All queued downloads have finished");
                }
                last = summary;
            }

            for job in jobs.iter().filter(|j| j.state == JobState::InProgress) {
                event!(
                    Level::DEBUG,
                    "{} - {}: {:.0}%",
                    job.artist,
                    job.title,
                    job.progress
                );
            }
        }

        event!(Level::DEBUG, "Progress reporter shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::stub::StubCatalog;
    use crate::config::test_config;
    use crate::jobs::{DownloadTarget, Outcome, TargetKind};
    use crate::queue::test_queue;

    #[tokio::test]
    async fn counts_jobs_per_state() {
        let queue = test_queue(
            std::sync::Arc::new(StubCatalog::with_album("4", &["a", "b", "c", "d"])),
            test_config(std::path::Path::new("/music")),
        );
        let reporter = ProgressReporter::new(&queue);
        assert_eq!(reporter.summary().await, QueueSummary::default());

        queue
            .enqueue(&DownloadTarget::new(TargetKind::Album, "4").unwrap())
            .await
            .unwrap();
        let a = queue.dequeue_next(0).await.unwrap();
        queue.report_result(&a.id, Outcome::Completed(None)).await.unwrap();
        let b = queue.dequeue_next(0).await.unwrap();
        queue.report_result(&b.id, Outcome::Skipped).await.unwrap();
        let _c = queue.dequeue_next(1).await.unwrap();

        let (summary, jobs) = reporter.report().await;
        assert_eq!(
            summary,
            QueueSummary {
                pending: 1,
                in_progress: 1,
                completed: 1,
                failed: 0,
                skipped: 1,
                total: 4,
            }
        );
        assert!(!summary.is_idle());
        assert_eq!(jobs.len(), 4);
        assert_eq!(reporter.details().await, jobs);
        assert_eq!(
            summary.to_string(),
            "1 pending, 1 in progress, 1 completed, 0 failed, 1 skipped (4 total)"
        );

        // Observing never changes anything.
        assert_eq!(queue.snapshot().await, jobs);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let queue = test_queue(
            std::sync::Arc::new(StubCatalog::default()),
            test_config(std::path::Path::new("/music")),
        );
        let (send_shutdown, recv_shutdown) = tokio::sync::broadcast::channel::<()>(1);
        let handle = tokio::spawn(
            ProgressReporter::new(&queue).run(std::time::Duration::from_millis(5), recv_shutdown),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(send_shutdown);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
