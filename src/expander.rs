use crate::catalog::Catalog;
use crate::config::Config;
use crate::errors::ResolutionError;
use crate::jobs::{DownloadTarget, Job, TargetKind, TrackMeta};
use tracing::{Level, event};

const MAX_COMPONENT_LEN: usize = 250;

// Make `name` usable as a single path component on common file systems. Colons
// become the look-alike U+A789 so titles like "Act I: Prologue" stay readable.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            ':' => '\u{A789}',
            '<' | '>' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    trimmed.chars().take(MAX_COMPONENT_LEN).collect()
}

// Substitute `{key}` placeholders in `template` in a single pass, so braces
// inside a substituted value are copied verbatim. Unknown placeholders are
// left untouched.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let (before, tail) = rest.split_at(open);
        out.push_str(before);

        let found = tail.find('}').and_then(|close| {
            let key = tail.get(1..close)?;
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, value)| (close, *value))
        });
        match found {
            Some((close, value)) => {
                out.push_str(value);
                rest = tail.get(close.saturating_add(1)..).unwrap_or_default();
            }
            None => {
                out.push('{');
                rest = tail.get(1..).unwrap_or_default();
            }
        }
    }

    out.push_str(rest);
    out
}

// Fill in album position and size from the album itself, for tracks that are
// laid out per album but expanded as part of a bigger target.
fn number_album_tracks(tracks: Vec<TrackMeta>) -> impl Iterator<Item = TrackMeta> {
    let total = u32::try_from(tracks.len()).unwrap_or(u32::MAX);
    tracks.into_iter().zip(1u32..).map(move |(mut meta, position)| {
        if meta.track_number == 0 {
            meta.track_number = position;
        }
        meta.total_tracks.get_or_insert(total);
        meta
    })
}

fn or_unknown(value: &str, fallback: &str) -> String {
    let clean = sanitize_filename(value);
    if clean.is_empty() {
        fallback.to_string()
    } else {
        clean
    }
}

#[derive(Clone, Debug)]
/// Where and how the tracks of one resolved target are laid out.
enum Layout {
    Library,
    Compilation { folder: String, title: String },
}

/// The resolved member tracks of a target. Iterating yields one `Job` per
/// track in source order; resolving the same target again restarts it.
pub(crate) struct Expansion {
    target: DownloadTarget,
    layout: Layout,
    config: std::sync::Arc<Config>,
    tracks: std::iter::Enumerate<std::vec::IntoIter<TrackMeta>>,
    total: u32,
}

impl Expansion {
    fn build_job(&self, position: u32, mut meta: TrackMeta) -> Job {
        let config = &self.config;
        let quality = config.quality;
        let ext = quality.extension();

        let (folder, file, id) = match &self.layout {
            Layout::Compilation { folder, title } => {
                meta.album.clone_from(title);
                meta.album_artist = Some(config.compilation_artist.clone());
                meta.track_number = position;
                meta.total_tracks = Some(self.total);

                let file = format!(
                    "{position:02} - {} - {}",
                    or_unknown(&meta.artist, "Unknown Artist"),
                    or_unknown(&meta.title, "Unknown Track"),
                );
                let id = format!(
                    "track_{}_pl_{}_{position}",
                    meta.track_id,
                    self.target.id()
                );
                (std::path::PathBuf::from(folder), file, id)
            }
            Layout::Library => {
                if meta.track_number == 0 {
                    meta.track_number = position;
                }
                if meta.total_tracks.is_none() && self.target.kind() == TargetKind::Album {
                    meta.total_tracks = Some(self.total);
                }

                let artist = or_unknown(
                    meta.album_artist.as_deref().unwrap_or(&meta.artist),
                    "Unknown Artist",
                );
                let album = or_unknown(&meta.album, "Unknown Album");
                let year = meta.year.map_or_else(|| "Unknown".to_string(), |y| y.to_string());
                let folder = render(
                    &config.album_folder_template,
                    &[
                        ("artist", &artist),
                        ("album", &album),
                        ("year", &year),
                        ("quality", quality.as_str()),
                    ],
                );

                let track_number = format!("{:02}", meta.track_number);
                let file = render(
                    &config.track_file_template,
                    &[
                        ("track_number", &track_number),
                        ("title", &or_unknown(&meta.title, "Unknown Track")),
                        ("artist", &or_unknown(&meta.artist, "Unknown Artist")),
                        ("album", &album),
                        ("quality", quality.as_str()),
                    ],
                );

                let id = match self.target.kind() {
                    TargetKind::Playlist => format!(
                        "track_{}_pl_{}_{position}",
                        meta.track_id,
                        self.target.id()
                    ),
                    TargetKind::Track | TargetKind::Album | TargetKind::Artist => {
                        format!("track_{}", meta.track_id)
                    }
                };
                (std::path::PathBuf::from(folder), file, id)
            }
        };

        let destination = config.folder.join(folder).join(format!("{file}.{ext}"));
        Job::new(id, self.target.clone(), meta, quality, destination)
    }

    pub(crate) fn len(&self) -> usize {
        self.tracks.len()
    }
}

impl Iterator for Expansion {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        let (idx, meta) = self.tracks.next()?;
        let position = u32::try_from(idx).unwrap_or(u32::MAX).saturating_add(1);
        Some(self.build_job(position, meta))
    }
}

#[derive(Clone)]
/// Resolves download targets against the catalog.
pub(crate) struct Expander {
    catalog: std::sync::Arc<dyn Catalog>,
    config: std::sync::Arc<Config>,
}

impl Expander {
    pub(crate) fn new(catalog: std::sync::Arc<dyn Catalog>, config: std::sync::Arc<Config>) -> Self {
        Self { catalog, config }
    }

    pub(crate) async fn expand(&self, target: &DownloadTarget) -> Result<Expansion, ResolutionError> {
        event!(Level::DEBUG, "Resolving {target}...");

        let lookup_err = |source| ResolutionError::Lookup {
            kind: target.kind().to_string(),
            id: target.id().to_string(),
            source,
        };

        let (tracks, layout) = match target.kind() {
            TargetKind::Track => {
                let meta = self.catalog.track(target.id()).await.map_err(lookup_err)?;
                (vec![meta], Layout::Library)
            }
            TargetKind::Album => {
                let album = self.catalog.album(target.id()).await.map_err(lookup_err)?;
                (album.tracks, Layout::Library)
            }
            TargetKind::Playlist => {
                let playlist = self
                    .catalog
                    .playlist(target.id())
                    .await
                    .map_err(lookup_err)?;
                let layout = if self.config.playlist_as_compilation {
                    Layout::Compilation {
                        folder: or_unknown(&playlist.title, "Unknown Playlist"),
                        title: playlist.title,
                    }
                } else {
                    Layout::Library
                };
                (playlist.tracks, layout)
            }
            TargetKind::Artist => {
                let discography = self
                    .catalog
                    .artist_albums(target.id())
                    .await
                    .map_err(lookup_err)?;
                let mut tracks = Vec::new();
                for album_id in &discography.albums {
                    let album = self.catalog.album(album_id).await.map_err(lookup_err)?;
                    event!(
                        Level::DEBUG,
                        "Album {album_id} of {target}: {} ({} track(s))",
                        album.title,
                        album.tracks.len()
                    );
                    tracks.extend(number_album_tracks(album.tracks));
                }
                (tracks, Layout::Library)
            }
        };

        if tracks.is_empty() {
            return Err(ResolutionError::Empty {
                kind: target.kind().to_string(),
                id: target.id().to_string(),
            });
        }

        event!(
            Level::DEBUG,
            "Resolved {target} into {} track(s)",
            tracks.len()
        );

        Ok(Expansion {
            target: target.clone(),
            layout,
            config: self.config.clone(),
            total: u32::try_from(tracks.len()).unwrap_or(u32::MAX),
            tracks: tracks.into_iter().enumerate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Collection;
    use crate::catalog::stub::{StubCatalog, track};
    use crate::config::{Quality, test_config};
    use crate::errors::FetchError;

    fn expander(catalog: StubCatalog, config: Config) -> Expander {
        Expander::new(std::sync::Arc::new(catalog), std::sync::Arc::new(config))
    }

    #[test]
    fn sanitizes_path_components() {
        assert_eq!(sanitize_filename("Act I: Prologue"), "Act I\u{A789} Prologue");
        assert_eq!(sanitize_filename("AC/DC"), "AC_DC");
        assert_eq!(sanitize_filename("  ...Why?  "), "Why_");
        assert_eq!(sanitize_filename("Song (feat. X)"), "Song (feat. X)");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 250);
    }

    #[tokio::test]
    async fn album_expands_in_source_order() {
        let catalog = StubCatalog::with_album("7", &["Intro", "Middle", "Outro", "Bonus"]);
        let config = test_config(std::path::Path::new("/music"));
        let jobs: Vec<Job> = expander(catalog, config)
            .expand(&DownloadTarget::new(TargetKind::Album, "7").unwrap())
            .await
            .unwrap()
            .collect();

        assert_eq!(jobs.len(), 4);
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["track_71", "track_72", "track_73", "track_74"]);
        assert_eq!(
            jobs[2].destination,
            std::path::PathBuf::from("/music/Artist/Album [2001]/03 - Outro.flac")
        );
        assert_eq!(jobs[0].meta.total_tracks, Some(4));
        assert_eq!(jobs[0].quality, Quality::Lossless);
    }

    #[tokio::test]
    async fn playlist_compilation_layout() {
        let mut catalog = StubCatalog::default();
        catalog.playlists.insert(
            "ab-12".to_string(),
            Collection {
                title: "Road: Trip".to_string(),
                tracks: vec![track("5", "Drive", 9), track("5", "Drive", 9), track("6", "Home", 1)],
            },
        );
        let mut config = test_config(std::path::Path::new("/music"));
        config.quality = Quality::High;

        let jobs: Vec<Job> = expander(catalog, config)
            .expand(&DownloadTarget::new(TargetKind::Playlist, "ab-12").unwrap())
            .await
            .unwrap()
            .collect();

        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(
            ids,
            ["track_5_pl_ab-12_1", "track_5_pl_ab-12_2", "track_6_pl_ab-12_3"]
        );
        assert_eq!(
            jobs[2].destination,
            std::path::PathBuf::from("/music/Road\u{A789} Trip/03 - Artist - Home.m4a")
        );
        assert_eq!(jobs[2].meta.album, "Road: Trip");
        assert_eq!(jobs[2].meta.album_artist.as_deref(), Some("Various Artists"));
        assert_eq!(jobs[2].meta.track_number, 3);
        assert_eq!(jobs[2].meta.total_tracks, Some(3));
    }

    #[test]
    fn placeholders_are_substituted_once() {
        let values = [("album", "{year}"), ("year", "1999")];
        assert_eq!(render("{album} [{year}]", &values), "{year} [1999]");
        assert_eq!(render("{{year}} {other}", &values), "{1999}} {other}");
        assert_eq!(render("open {year", &values), "open {year");
    }

    #[tokio::test]
    async fn braces_in_album_names_survive() {
        let mut catalog = StubCatalog::with_album("7", &["Intro"]);
        if let Some(album) = catalog.albums.get_mut("7") {
            album.tracks[0].album = "{year}".to_string();
        }
        let jobs: Vec<Job> = expander(catalog, test_config(std::path::Path::new("/music")))
            .expand(&DownloadTarget::new(TargetKind::Album, "7").unwrap())
            .await
            .unwrap()
            .collect();
        assert_eq!(
            jobs[0].destination,
            std::path::PathBuf::from("/music/Artist/{year} [2001]/01 - Intro.flac")
        );
    }

    #[tokio::test]
    async fn artist_expands_every_album() {
        let mut catalog = StubCatalog::with_album("1", &["a", "b"]);
        let second = StubCatalog::with_album("2", &["c", "d", "e"]);
        let mut later = second.albums["2"].clone();
        for t in &mut later.tracks {
            t.album = "Later".to_string();
            t.year = Some(2005);
        }
        catalog.albums.insert("2".to_string(), later);
        catalog.artists.insert(
            "42".to_string(),
            crate::catalog::Discography {
                albums: vec!["1".to_string(), "2".to_string()],
            },
        );
        let expander = expander(catalog, test_config(std::path::Path::new("/music")));

        let jobs: Vec<Job> = expander
            .expand(&DownloadTarget::new(TargetKind::Artist, "42").unwrap())
            .await
            .unwrap()
            .collect();
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["track_11", "track_12", "track_21", "track_22", "track_23"]);
        assert_eq!(
            jobs[4].destination,
            std::path::PathBuf::from("/music/Artist/Later [2005]/03 - e.flac")
        );
        // Numbering and totals are per album, not per discography.
        assert_eq!(jobs[1].meta.total_tracks, Some(2));
        assert_eq!(jobs[2].meta.track_number, 1);
        assert_eq!(jobs[2].meta.total_tracks, Some(3));

        let unknown = expander
            .expand(&DownloadTarget::new(TargetKind::Artist, "7").unwrap())
            .await;
        assert!(matches!(
            unknown,
            Err(ResolutionError::Lookup {
                source: FetchError::NotFound(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn artist_without_albums_is_empty() {
        let mut catalog = StubCatalog::default();
        catalog.artists.insert(
            "42".to_string(),
            crate::catalog::Discography { albums: vec![] },
        );
        let result = expander(catalog, test_config(std::path::Path::new("/music")))
            .expand(&DownloadTarget::new(TargetKind::Artist, "42").unwrap())
            .await;
        assert!(matches!(result, Err(ResolutionError::Empty { .. })));
    }

    #[tokio::test]
    async fn single_track_yields_one_job() {
        let catalog = StubCatalog::with_album("9", &["Only"]);
        let config = test_config(std::path::Path::new("/music"));
        let expansion = expander(catalog, config)
            .expand(&DownloadTarget::new(TargetKind::Track, "91").unwrap())
            .await
            .unwrap();
        assert_eq!(expansion.len(), 1);
        let jobs: Vec<Job> = expansion.collect();
        assert_eq!(jobs[0].id, "track_91");
        assert_eq!(jobs[0].meta.title, "Only");
    }

    #[tokio::test]
    async fn resolution_errors_surface() {
        let mut catalog = StubCatalog::default();
        catalog.albums.insert(
            "empty".to_string(),
            Collection {
                title: "Nothing".to_string(),
                tracks: vec![],
            },
        );
        let expander = expander(catalog, test_config(std::path::Path::new("/music")));

        let missing = expander
            .expand(&DownloadTarget::new(TargetKind::Album, "nope").unwrap())
            .await;
        assert!(matches!(
            missing,
            Err(ResolutionError::Lookup {
                source: FetchError::NotFound(_),
                ..
            })
        ));

        let empty = expander
            .expand(&DownloadTarget::new(TargetKind::Album, "empty").unwrap())
            .await;
        assert!(matches!(empty, Err(ResolutionError::Empty { .. })));
    }
}
