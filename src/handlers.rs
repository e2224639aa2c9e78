use crate::errors::ResolutionError;
use crate::jobs::{DownloadTarget, JobView, TargetKind};
use crate::queue::QueueManager;
use crate::reporter::{ProgressReporter, QueueSummary};
use tracing::{Level, event};

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
/// A download request names its target either by catalog URL or by kind and
/// ID directly.
pub(crate) enum DownloadsReq {
    Url { url: String },
    Target { kind: String, id: String },
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct DownloadsResp {
    status: String,
    job_ids: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct QueueResp {
    summary: QueueSummary,
    jobs: Vec<JobView>,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct StatusResp {
    status: String,
}

#[derive(Debug, serde::Serialize)]
pub(crate) struct RemovedResp {
    removed: usize,
}

#[derive(Clone)]
/// Wraps state that each HTTP handler might need to have access to.
pub(crate) struct HTTPHandlerState {
    queue: QueueManager,
    reporter: ProgressReporter,
    target_re: regex::Regex,
}

impl HTTPHandlerState {
    pub(crate) fn new(queue: &QueueManager, reporter: &ProgressReporter) -> anyhow::Result<Self> {
        Ok(HTTPHandlerState {
            queue: queue.clone(),
            reporter: reporter.clone(),
            target_re: regex::Regex::new(
                r"(?i)^(?:https?://)?[a-z0-9.-]+(?::\d+)?/(?:browse/)?(track|album|playlist|artist)/([a-z0-9-]+)/?(?:[?#].*)?$",
            )?,
        })
    }
}

// Extracts the target kind and ID from a catalog web URL such as
// 'https://catalog.example/browse/album/12345' or
// 'listen.catalog.example/playlist/0f1e-22'. Everything after the ID (query,
// fragment) is ignored.
fn parse_target_url(target_re: &regex::Regex, url: &str) -> Result<DownloadTarget, ResolutionError> {
    let url = url.trim();
    let Some(caps) = target_re.captures(url) else {
        event!(Level::DEBUG, "Unsupported or invalid download URL: {url}");
        return Err(ResolutionError::UnrecognizedTarget(url.to_string()));
    };

    let kind = TargetKind::parse(&caps[1])
        .ok_or_else(|| ResolutionError::UnrecognizedTarget(url.to_string()))?;

    DownloadTarget::new(kind, &caps[2])
}

fn parse_request(
    target_re: &regex::Regex,
    payload: &DownloadsReq,
) -> Result<DownloadTarget, ResolutionError> {
    match payload {
        DownloadsReq::Url { url } => parse_target_url(target_re, url),
        DownloadsReq::Target { kind, id } => {
            let kind = TargetKind::parse(kind)
                .ok_or_else(|| ResolutionError::UnrecognizedTarget(format!("{kind} {id}")))?;
            DownloadTarget::new(kind, id)
        }
    }
}

/// Handle a POST request naming a track, album, playlist or artist to download. The
/// target is resolved right away, so unknown IDs are rejected here rather
/// than showing up as failed jobs later.
pub(crate) async fn post_downloads(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState>,
    axum::Json(payload): axum::Json<DownloadsReq>,
) -> (axum::http::StatusCode, axum::Json<DownloadsResp>) {
    let target = match parse_request(&state.target_re, &payload) {
        Ok(t) => t,
        Err(e) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(DownloadsResp {
                    status: e.to_string(),
                    job_ids: Vec::new(),
                }),
            );
        }
    };
    event!(Level::DEBUG, "Received valid download target: {target}");

    match state.queue.enqueue(&target).await {
        Ok(job_ids) => (
            axum::http::StatusCode::CREATED,
            axum::Json(DownloadsResp {
                status: format!("Queued {} track(s) for {target}", job_ids.len()),
                job_ids,
            }),
        ),
        Err(e) => {
            event!(Level::INFO, "Rejected download of {target}: {e}");
            (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(DownloadsResp {
                    status: e.to_string(),
                    job_ids: Vec::new(),
                }),
            )
        }
    }
}

pub(crate) async fn get_queue(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState>,
) -> axum::Json<QueueResp> {
    let (summary, jobs) = state.reporter.report().await;
    axum::Json(QueueResp { summary, jobs })
}

/// Cancel a job that hasn't been picked up by a worker yet.
pub(crate) async fn delete_queue_job(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState>,
    axum::extract::Path(job_id): axum::extract::Path<String>,
) -> (axum::http::StatusCode, axum::Json<StatusResp>) {
    if state.queue.cancel(&job_id).await {
        (
            axum::http::StatusCode::OK,
            axum::Json(StatusResp {
                status: format!("Cancelled job {job_id}"),
            }),
        )
    } else {
        (
            axum::http::StatusCode::CONFLICT,
            axum::Json(StatusResp {
                status: format!("Job {job_id} is not pending and can't be cancelled"),
            }),
        )
    }
}

pub(crate) async fn post_queue_purge(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState>,
) -> axum::Json<RemovedResp> {
    let removed = state.queue.remove_completed().await;
    event!(Level::INFO, "Purged {removed} finished job(s)");
    axum::Json(RemovedResp { removed })
}

pub(crate) async fn post_queue_clear(
    axum::extract::State(state): axum::extract::State<HTTPHandlerState>,
) -> axum::Json<RemovedResp> {
    let removed = state.queue.clear_pending().await;
    event!(Level::INFO, "Cleared {removed} pending job(s)");
    axum::Json(RemovedResp { removed })
}

/// All routes of the JSON API. Clients have to accept JSON responses.
pub(crate) fn router(handler_state: HTTPHandlerState) -> axum::Router {
    axum::Router::new()
        .route("/downloads", axum::routing::post(post_downloads))
        .route("/queue", axum::routing::get(get_queue))
        .route("/queue/{job_id}", axum::routing::delete(delete_queue_job))
        .route("/queue/purge", axum::routing::post(post_queue_purge))
        .route("/queue/clear", axum::routing::post(post_queue_clear))
        .layer(tower_http::validate_request::ValidateRequestHeaderLayer::accept(
            "application/json",
        ))
        .with_state(handler_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::stub::StubCatalog;
    use crate::config::test_config;
    use crate::queue::test_queue;

    fn target_re() -> regex::Regex {
        let queue = test_queue(
            std::sync::Arc::new(StubCatalog::default()),
            test_config(std::path::Path::new("/music")),
        );
        let reporter = ProgressReporter::new(&queue);
        HTTPHandlerState::new(&queue, &reporter).unwrap().target_re
    }

    #[test]
    fn test_parse_target_urls() {
        let re = target_re();

        // Below URL inputs to parse_target_url() should all be rejected.
        let should_error = [
            "",
            "abc",
            "https://catalog.example/",
            "https://catalog.example/video/12345",
            "https://catalog.example/album/",
            "https://catalog.example/album/12 345",
            "https://catalog.example/album/123/tracks",
            "ftp://catalog.example/album/123",
        ];
        for url in should_error {
            assert!(
                matches!(
                    parse_target_url(&re, url),
                    Err(ResolutionError::UnrecognizedTarget(_))
                ),
                "accepted {url}"
            );
        }

        // Below URL inputs should all resolve to the associated target.
        let should_succeed = [
            ("https://catalog.example/browse/track/77", TargetKind::Track, "77"),
            ("https://catalog.example/browse/album/12345", TargetKind::Album, "12345"),
            ("http://listen.catalog.example/album/12345/", TargetKind::Album, "12345"),
            ("catalog.example/TRACK/9?u", TargetKind::Track, "9"),
            (
                "https://listen.catalog.example/playlist/0f1e2d3c-aaaa-bbbb#top",
                TargetKind::Playlist,
                "0f1e2d3c-aaaa-bbbb",
            ),
            ("  http://localhost:8080/playlist/mix-1  ", TargetKind::Playlist, "mix-1"),
            ("https://catalog.example/browse/artist/3520813", TargetKind::Artist, "3520813"),
        ];
        for (url, kind, id) in should_succeed {
            let target = parse_target_url(&re, url).unwrap();
            assert_eq!((target.kind(), target.id()), (kind, id), "for {url}");
        }
    }

    #[test]
    fn test_parse_kind_and_id_requests() {
        let re = target_re();
        let ok = parse_request(
            &re,
            &DownloadsReq::Target {
                kind: "Album".into(),
                id: " 12 ".into(),
            },
        )
        .unwrap();
        assert_eq!((ok.kind(), ok.id()), (TargetKind::Album, "12"));

        let artist = parse_request(
            &re,
            &DownloadsReq::Target {
                kind: "artist".into(),
                id: "42".into(),
            },
        )
        .unwrap();
        assert_eq!((artist.kind(), artist.id()), (TargetKind::Artist, "42"));

        assert!(matches!(
            parse_request(
                &re,
                &DownloadsReq::Target {
                    kind: "video".into(),
                    id: "1".into(),
                }
            ),
            Err(ResolutionError::UnrecognizedTarget(_))
        ));
        assert!(matches!(
            parse_request(
                &re,
                &DownloadsReq::Target {
                    kind: "track".into(),
                    id: String::new(),
                }
            ),
            Err(ResolutionError::InvalidId { .. })
        ));
    }

    async fn serve_api() -> (String, QueueManager) {
        let queue = test_queue(
            std::sync::Arc::new(StubCatalog::with_album("5", &["a", "b", "c"])),
            test_config(std::path::Path::new("/music")),
        );
        let reporter = ProgressReporter::new(&queue);
        let router = router(HTTPHandlerState::new(&queue, &reporter).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        (format!("http://{addr}"), queue)
    }

    #[tokio::test]
    async fn api_queues_inspects_and_cancels() {
        let (base, queue) = serve_api().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/downloads"))
            .json(&serde_json::json!({"url": "https://catalog.example/browse/album/5"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["job_ids"], serde_json::json!(["track_51", "track_52", "track_53"]));

        let resp = client
            .post(format!("{base}/downloads"))
            .json(&serde_json::json!({"kind": "album", "id": "6"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let claimed = queue.dequeue_next(0).await.unwrap();
        let resp = client
            .delete(format!("{base}/queue/{}", claimed.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);
        let resp = client
            .delete(format!("{base}/queue/track_53"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        let body: serde_json::Value = client
            .get(format!("{base}/queue"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["in_progress"], 1);
        assert_eq!(body["jobs"][0]["state"], "IN_PROGRESS");
        assert_eq!(body["jobs"][1]["id"], "track_52");

        let body: serde_json::Value = client
            .post(format!("{base}/queue/clear"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["removed"], 1);
    }

    #[tokio::test]
    async fn api_requires_json_responses_to_be_acceptable() {
        let (base, _) = serve_api().await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/queue"))
            .header(reqwest::header::ACCEPT, "text/html")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_ACCEPTABLE);
    }
}
