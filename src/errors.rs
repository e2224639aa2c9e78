use thiserror::Error;

#[derive(Debug, Error)]
/// A download target could not be turned into track jobs. Never retried, the
/// condition will not go away by asking again.
pub(crate) enum ResolutionError {
    #[error("invalid {kind} identifier '{id}'")]
    InvalidId { kind: String, id: String },

    #[error("unrecognized download target '{0}'")]
    UnrecognizedTarget(String),

    #[error("{kind} '{id}' has no tracks")]
    Empty { kind: String, id: String },

    #[error("catalog lookup for {kind} '{id}' failed: {source}")]
    Lookup {
        kind: String,
        id: String,
        #[source]
        source: FetchError,
    },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
/// Errors raised by the remote catalog when resolving metadata or opening a
/// track stream.
pub(crate) enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by catalog")]
    RateLimited,

    #[error("catalog server error (HTTP {0})")]
    Server(u16),

    #[error("stream interrupted: {0}")]
    Interrupted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied by catalog (HTTP {0})")]
    Unauthorized(u16),

    #[error("track not available in quality {0}")]
    QualityUnavailable(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl FetchError {
    /// Whether retrying the same request later has a chance of succeeding.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::RateLimited
                | FetchError::Server(_)
                | FetchError::Interrupted(_)
        )
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, what: &str) -> FetchError {
        match status.as_u16() {
            404 | 410 => FetchError::NotFound(what.to_string()),
            code @ (401 | 403) => FetchError::Unauthorized(code),
            409 | 415 | 422 => FetchError::QualityUnavailable(what.to_string()),
            429 => FetchError::RateLimited,
            400 => FetchError::InvalidId(what.to_string()),
            code if status.is_server_error() => FetchError::Server(code),
            code => FetchError::Network(format!("unexpected HTTP status {code} for {what}")),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let what = err.url().map_or_else(String::new, ToString::to_string);
            return FetchError::from_status(status, &what);
        }
        if err.is_body() || err.is_decode() {
            FetchError::Interrupted(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "message")]
/// The error recorded on a job record.
pub(crate) enum JobError {
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    #[error("permanent fetch error: {0}")]
    PermanentFetch(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl JobError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, JobError::TransientFetch(_))
    }
}

impl From<FetchError> for JobError {
    fn from(err: FetchError) -> Self {
        if err.is_transient() {
            JobError::TransientFetch(err.to_string())
        } else {
            JobError::PermanentFetch(err.to_string())
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::Filesystem(err.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("tag write warning: {0}")]
/// Writing tags into a finished file failed. The audio itself is fine.
pub(crate) struct TagWriteWarning(pub(crate) String);

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum QueueError {
    #[error("job {0} is not in the queue")]
    UnknownJob(String),

    #[error("job {0} is not claimed by a worker")]
    NotClaimed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Invalid configuration, reported once at startup before any job runs.
pub(crate) enum ConfigError {
    #[error("'{0}' needs to be at least 1")]
    TooSmall(&'static str),

    #[error("download folder must not be empty")]
    EmptyFolder,

    #[error("catalog URL '{0}' must start with http:// or https://")]
    CatalogUrl(String),

    #[error("track file template '{0}' must contain '{{title}}'")]
    Template(String),

    #[error("album art file name '{0}' must be a plain file name")]
    ArtFilename(String),
}

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("malformed stored job {id}: {reason}")]
    Malformed { id: String, reason: String },
}
