use crate::config::Quality;
use crate::errors::FetchError;
use crate::jobs::TrackMeta;
use futures_util::StreamExt;
use tracing::{Level, event};

#[derive(Clone, Debug, serde::Deserialize)]
/// An album or playlist as listed by the catalog: its title and member tracks
/// in source order.
pub(crate) struct Collection {
    pub(crate) title: String,
    pub(crate) tracks: Vec<TrackMeta>,
}

#[derive(Clone, Debug, serde::Deserialize)]
/// IDs of all albums released by one artist, oldest first.
pub(crate) struct Discography {
    pub(crate) albums: Vec<String>,
}

/// The audio of one track as a sequence of byte chunks.
pub(crate) struct TrackStream {
    pub(crate) content_length: Option<u64>,
    pub(crate) chunks: futures_util::stream::BoxStream<'static, Result<axum::body::Bytes, FetchError>>,
}

#[async_trait::async_trait]
/// The remote catalog/session collaborator. Resolves identifiers to metadata
/// and hands out audio streams at a requested quality tier.
pub(crate) trait Catalog: Send + Sync {
    async fn track(&self, id: &str) -> Result<TrackMeta, FetchError>;

    async fn album(&self, id: &str) -> Result<Collection, FetchError>;

    async fn playlist(&self, id: &str) -> Result<Collection, FetchError>;

    async fn artist_albums(&self, id: &str) -> Result<Discography, FetchError>;

    /// Download the cover image behind a track's `cover_url`.
    async fn fetch_cover(&self, url: &str) -> Result<axum::body::Bytes, FetchError>;

    async fn open_stream(&self, track_id: &str, quality: Quality)
    -> Result<TrackStream, FetchError>;
}

#[derive(Clone, Debug)]
/// Talks JSON over HTTP to a catalog endpoint rooted at `base_url`.
pub(crate) struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCatalog {
    pub(crate) fn new(base_url: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .read_timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("trackdl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(format!("{}/{path}", self.base_url));
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        event!(Level::DEBUG, "Catalog lookup {path}");
        let resp = self
            .get(path)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, path));
        }

        Ok(resp.json::<T>().await?)
    }
}

#[async_trait::async_trait]
impl Catalog for HttpCatalog {
    async fn track(&self, id: &str) -> Result<TrackMeta, FetchError> {
        self.get_json(&format!("tracks/{id}")).await
    }

    async fn album(&self, id: &str) -> Result<Collection, FetchError> {
        self.get_json(&format!("albums/{id}")).await
    }

    async fn playlist(&self, id: &str) -> Result<Collection, FetchError> {
        self.get_json(&format!("playlists/{id}")).await
    }

    async fn artist_albums(&self, id: &str) -> Result<Discography, FetchError> {
        self.get_json(&format!("artists/{id}/albums")).await
    }

    // Cover URLs usually point at a CDN, so the catalog token isn't sent along.
    async fn fetch_cover(&self, url: &str) -> Result<axum::body::Bytes, FetchError> {
        event!(Level::DEBUG, "Fetching cover {url}");
        let resp = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, url));
        }

        Ok(resp.bytes().await?)
    }

    async fn open_stream(
        &self,
        track_id: &str,
        quality: Quality,
    ) -> Result<TrackStream, FetchError> {
        let path = format!("tracks/{track_id}/stream");
        let resp = self
            .get(&path)
            .query(&[("quality", quality.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, &path));
        }

        let content_length = resp.content_length();
        let chunks = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FetchError::Interrupted(e.to_string())))
            .boxed();

        Ok(TrackStream {
            content_length,
            chunks,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    async fn serve_catalog() -> String {
        let router = axum::Router::new()
            .route(
                "/albums/{id}",
                axum::routing::get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    axum::Json(serde_json::json!({
                        "title": format!("Album {id}"),
                        "tracks": [
                            {"track_id": "1", "title": "One", "artist": "A", "album": "Album", "track_number": 1},
                            {"track_id": "2", "title": "Two", "artist": "A", "album": "Album", "track_number": 2, "year": 1999}
                        ]
                    }))
                }),
            )
            .route(
                "/artists/{id}/albums",
                axum::routing::get(|| async { axum::Json(serde_json::json!({"albums": ["10", "11"]})) }),
            )
            .route(
                "/covers/{name}",
                axum::routing::get(|axum::extract::Path(name): axum::extract::Path<String>| async move {
                    if name == "front.jpg" {
                        (axum::http::StatusCode::OK, "jpeg bytes".to_string())
                    } else {
                        (axum::http::StatusCode::NOT_FOUND, String::new())
                    }
                }),
            )
            .route(
                "/tracks/{id}/stream",
                axum::routing::get(
                    |axum::extract::Path(id): axum::extract::Path<String>,
                     axum::extract::Query(q): axum::extract::Query<std::collections::HashMap<String, String>>| async move {
                        match (id.as_str(), q.get("quality").map(String::as_str)) {
                            ("1", Some("LOSSLESS")) => (axum::http::StatusCode::OK, "flac bytes".to_string()),
                            ("1", _) => (axum::http::StatusCode::UNPROCESSABLE_ENTITY, String::new()),
                            ("2", _) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, String::new()),
                            (_, _) => (axum::http::StatusCode::NOT_FOUND, String::new()),
                        }
                    },
                ),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_catalog_lists_album_tracks() {
        let catalog = HttpCatalog::new(&serve_catalog().await, None).unwrap();
        let album = catalog.album("42").await.unwrap();
        assert_eq!(album.title, "Album 42");
        let titles: Vec<&str> = album.tracks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, ["One", "Two"]);
        assert_eq!(album.tracks[1].year, Some(1999));
        assert_eq!(album.tracks[0].cover_url, None);
    }

    #[tokio::test]
    async fn http_catalog_streams_and_classifies() {
        let catalog = HttpCatalog::new(&serve_catalog().await, Some("secret".into())).unwrap();

        let mut stream = catalog.open_stream("1", Quality::Lossless).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = stream.chunks.next().await {
            body.extend(chunk.unwrap());
        }
        assert_eq!(body, b"flac bytes");

        let unavailable = catalog.open_stream("1", Quality::HiRes).await.err().unwrap();
        assert!(matches!(unavailable, FetchError::QualityUnavailable(_)));
        assert!(!unavailable.is_transient());

        let busy = catalog.open_stream("2", Quality::Lossless).await.err().unwrap();
        assert_eq!(busy, FetchError::Server(503));
        assert!(busy.is_transient());

        let missing = catalog.track("404").await.err().unwrap();
        assert!(matches!(missing, FetchError::NotFound(_)));
    }

    #[tokio::test]
    async fn http_catalog_lists_discography_and_covers() {
        let base = serve_catalog().await;
        let catalog = HttpCatalog::new(&base, None).unwrap();

        let discography = catalog.artist_albums("3").await.unwrap();
        assert_eq!(discography.albums, ["10", "11"]);

        let cover = catalog.fetch_cover(&format!("{base}covers/front.jpg")).await.unwrap();
        assert_eq!(&cover[..], b"jpeg bytes");
        let missing = catalog.fetch_cover(&format!("{base}covers/back.jpg")).await.err().unwrap();
        assert!(matches!(missing, FetchError::NotFound(_)));
    }
}
