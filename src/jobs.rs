use crate::config::Quality;
use crate::errors::{JobError, ResolutionError, TagWriteWarning};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum TargetKind {
    Track,
    Album,
    Playlist,
    Artist,
}

impl TargetKind {
    pub(crate) fn parse(s: &str) -> Option<TargetKind> {
        match s.to_ascii_lowercase().as_str() {
            "track" => Some(TargetKind::Track),
            "album" => Some(TargetKind::Album),
            "playlist" => Some(TargetKind::Playlist),
            "artist" => Some(TargetKind::Artist),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match self {
            TargetKind::Track => write!(f, "track"),
            TargetKind::Album => write!(f, "album"),
            TargetKind::Playlist => write!(f, "playlist"),
            TargetKind::Artist => write!(f, "artist"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// What a user asked to download: a single track, a whole album, a playlist or
/// an artist's discography, identified by its catalog ID.
pub(crate) struct DownloadTarget {
    kind: TargetKind,
    id: String,
}

impl DownloadTarget {
    pub(crate) fn new(kind: TargetKind, id: &str) -> Result<DownloadTarget, ResolutionError> {
        let id = id.trim();
        if id.is_empty()
            || id
                .chars()
                .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '?' || c == '#')
        {
            return Err(ResolutionError::InvalidId {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        }
        Ok(Self {
            kind,
            id: id.to_string(),
        })
    }

    pub(crate) fn kind(&self) -> TargetKind {
        self.kind
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{} {}", self.kind, self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// Descriptive metadata of one track, as delivered by the catalog and later
/// written into the downloaded file.
pub(crate) struct TrackMeta {
    pub(crate) track_id: String,
    pub(crate) title: String,
    pub(crate) artist: String,
    pub(crate) album: String,
    #[serde(default)]
    pub(crate) album_artist: Option<String>,
    pub(crate) track_number: u32,
    #[serde(default)]
    pub(crate) total_tracks: Option<u32>,
    #[serde(default)]
    pub(crate) year: Option<i32>,
    #[serde(default)]
    pub(crate) cover_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl JobState {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Skipped
        )
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Skipped => "SKIPPED",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<JobState> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "IN_PROGRESS" => Some(JobState::InProgress),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            "SKIPPED" => Some(JobState::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug)]
/// How a worker's attempt at a job ended.
pub(crate) enum Outcome {
    Completed(Option<TagWriteWarning>),
    Skipped,
    Failed(JobError),
}

#[derive(Clone, Debug)]
/// `Job` is the unit of work tracked by the queue: one track to fetch, tag and
/// place at `destination`. If failing with a transient error, the job is
/// attempted at most `max_retries` times.
pub(crate) struct Job {
    pub(crate) id: String,
    pub(crate) target: DownloadTarget,
    pub(crate) meta: TrackMeta,
    pub(crate) quality: Quality,
    pub(crate) destination: std::path::PathBuf,
    pub(crate) state: JobState,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<JobError>,
    pub(crate) warning: Option<String>,
    pub(crate) progress: f32,
    pub(crate) eligible_at: Option<tokio::time::Instant>,
    pub(crate) claimed_by: Option<usize>,
}

impl Job {
    pub(crate) fn new(
        id: String,
        target: DownloadTarget,
        meta: TrackMeta,
        quality: Quality,
        destination: std::path::PathBuf,
    ) -> Job {
        Self {
            id,
            target,
            meta,
            quality,
            destination,
            state: JobState::Pending,
            retry_count: 0,
            last_error: None,
            warning: None,
            progress: 0.0,
            eligible_at: None,
            claimed_by: None,
        }
    }

    /// Path the download is streamed into before being renamed to
    /// `destination`. Carries the job ID, so jobs sharing a destination never
    /// write into the same file. Never considered by the skip-existing check.
    pub(crate) fn temp_path(&self) -> std::path::PathBuf {
        self.temp_path_for(&self.destination)
    }

    /// This job's private temporary name for `path`.
    pub(crate) fn temp_path_for(&self, path: &std::path::Path) -> std::path::PathBuf {
        let tag: String = self
            .id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(format!(".{tag}.downloading"));
        std::path::PathBuf::from(tmp)
    }

    pub(crate) fn is_eligible(&self, now: tokio::time::Instant) -> bool {
        self.state == JobState::Pending && self.eligible_at.is_none_or(|at| at <= now)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
/// Read-only view of a job handed out by queue snapshots.
pub(crate) struct JobView {
    pub(crate) id: String,
    pub(crate) state: JobState,
    pub(crate) progress: f32,
    pub(crate) retry_count: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) warning: Option<String>,
    pub(crate) worker: Option<usize>,
    pub(crate) title: String,
    pub(crate) artist: String,
    pub(crate) destination: String,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            progress: job.progress,
            retry_count: job.retry_count,
            last_error: job.last_error.as_ref().map(ToString::to_string),
            warning: job.warning.clone(),
            worker: job.claimed_by,
            title: job.meta.title.clone(),
            artist: job.meta.artist.clone(),
            destination: job.destination.display().to_string(),
        }
    }
}
