use crate::config::Quality;
use crate::errors::{JobError, StoreError};
use crate::jobs::{DownloadTarget, Job, JobState, JobView, TargetKind, TrackMeta};
use crate::queue::QueueManager;
use sqlx::Row;
use tracing::{Level, event};

// Open connections to the SQLite database at `path`. Create the single table
// `jobs`, if it doesn't exist yet.
pub(crate) async fn init_db(path: &std::path::Path) -> anyhow::Result<sqlx::sqlite::SqlitePool> {
    let db_opts = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let db_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(db_opts)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS jobs (
            position INTEGER NOT NULL,
            id TEXT NOT NULL UNIQUE,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            meta TEXT NOT NULL,
            quality TEXT NOT NULL,
            destination TEXT NOT NULL,
            state TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            last_error TEXT,
            warning TEXT,
            updated_at TEXT NOT NULL
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    Ok(db_pool)
}

fn malformed(id: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Malformed {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

/// Replace the stored queue with `jobs`, all in one transaction.
pub(crate) async fn save_jobs(
    db_pool: &sqlx::sqlite::SqlitePool,
    jobs: &[Job],
) -> Result<(), StoreError> {
    let updated_at = chrono::Utc::now().to_rfc3339();
    let mut tx = db_pool.begin().await?;

    sqlx::query("DELETE FROM jobs;").execute(&mut *tx).await?;

    for (position, job) in jobs.iter().enumerate() {
        let meta = serde_json::to_string(&job.meta).map_err(|e| malformed(&job.id, e))?;
        let last_error = job
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| malformed(&job.id, e))?;

        sqlx::query(
            "INSERT INTO jobs ( position, id, target_kind, target_id, meta, quality,
                destination, state, retry_count, last_error, warning, updated_at )
            VALUES ( $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12 );",
        )
        .bind(i64::try_from(position).unwrap_or(i64::MAX))
        .bind(&job.id)
        .bind(job.target.kind().to_string())
        .bind(job.target.id())
        .bind(meta)
        .bind(job.quality.as_str())
        .bind(job.destination.to_string_lossy().into_owned())
        .bind(job.state.as_str())
        .bind(i64::from(job.retry_count))
        .bind(last_error)
        .bind(&job.warning)
        .bind(&updated_at)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;

    let kind: String = row.try_get("target_kind")?;
    let kind = TargetKind::parse(&kind)
        .ok_or_else(|| malformed(&id, format!("unknown target kind '{kind}'")))?;
    let target_id: String = row.try_get("target_id")?;
    let target = DownloadTarget::new(kind, &target_id).map_err(|e| malformed(&id, e))?;

    let meta: String = row.try_get("meta")?;
    let meta: TrackMeta = serde_json::from_str(&meta).map_err(|e| malformed(&id, e))?;

    let quality: String = row.try_get("quality")?;
    let quality = Quality::parse(&quality)
        .ok_or_else(|| malformed(&id, format!("unknown quality '{quality}'")))?;

    let state: String = row.try_get("state")?;
    let state = JobState::parse(&state)
        .ok_or_else(|| malformed(&id, format!("unknown state '{state}'")))?;

    let retry_count: i64 = row.try_get("retry_count")?;
    let retry_count = u32::try_from(retry_count).map_err(|e| malformed(&id, e))?;

    let last_error: Option<String> = row.try_get("last_error")?;
    let last_error: Option<JobError> = last_error
        .map(|e| serde_json::from_str(&e))
        .transpose()
        .map_err(|e| malformed(&id, e))?;

    let destination: String = row.try_get("destination")?;
    let mut job = Job::new(id, target, meta, quality, std::path::PathBuf::from(destination));
    job.state = state;
    job.retry_count = retry_count;
    job.last_error = last_error;
    job.warning = row.try_get("warning")?;
    if state.is_terminal() {
        job.progress = 100.0;
    }

    Ok(job)
}

/// All stored jobs in queue order. Rows that can't be turned back into a job
/// are logged and left out.
pub(crate) async fn load_jobs(db_pool: &sqlx::sqlite::SqlitePool) -> Result<Vec<Job>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, target_kind, target_id, meta, quality, destination, state,
            retry_count, last_error, warning
        FROM jobs
        ORDER BY position ASC;",
    )
    .fetch_all(db_pool)
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in &rows {
        match job_from_row(row) {
            Ok(job) => jobs.push(job),
            Err(e) => event!(Level::WARN, "Not restoring stored job: {e}"),
        }
    }

    Ok(jobs)
}

/// Write the queue to the database every `interval` in which it changed.
/// Returns on shutdown, leaving the final write to the caller once all
/// workers have stopped.
pub(crate) async fn checkpoint(
    queue: QueueManager,
    db_pool: sqlx::sqlite::SqlitePool,
    interval: std::time::Duration,
    mut recv_shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_saved: Vec<JobView> = Vec::new();

    loop {
        tokio::select! {
            _ = recv_shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = queue.snapshot().await;
        if snapshot == last_saved {
            continue;
        }

        match save_jobs(&db_pool, &queue.export().await).await {
            Ok(()) => {
                event!(Level::DEBUG, "Checkpointed {} job(s)", snapshot.len());
                last_saved = snapshot;
            }
            Err(e) => event!(Level::WARN, "Failed to checkpoint queue: {e}"),
        }
    }

    event!(Level::DEBUG, "Checkpointing shutting down...");
}
