use crate::errors::ConfigError;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// Audio quality tier requested from the catalog. The two lossy tiers come in
/// an MP4 container, the lossless ones as native FLAC.
pub(crate) enum Quality {
    #[value(name = "NORMAL")]
    Normal,
    #[value(name = "HIGH")]
    High,
    #[value(name = "LOSSLESS")]
    Lossless,
    #[value(name = "HI_RES")]
    HiRes,
}

impl Quality {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Quality::Normal => "NORMAL",
            Quality::High => "HIGH",
            Quality::Lossless => "LOSSLESS",
            Quality::HiRes => "HI_RES",
        }
    }

    pub(crate) fn extension(self) -> &'static str {
        match self {
            Quality::Normal | Quality::High => "m4a",
            Quality::Lossless | Quality::HiRes => "flac",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Quality> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Some(Quality::Normal),
            "HIGH" => Some(Quality::High),
            "LOSSLESS" => Some(Quality::Lossless),
            "HI_RES" => Some(Quality::HiRes),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, clap::Parser)]
/// Everything that shapes how tracks are downloaded and where they end up.
/// Each option can be given on the command line or via its environment
/// variable.
pub(crate) struct Config {
    #[arg(long, env = "DOWNLOAD_QUALITY", value_enum, ignore_case = true, default_value_t = Quality::Lossless)]
    /// Quality tier requested for every track.
    pub(crate) quality: Quality,

    #[arg(long, env = "DOWNLOAD_FOLDER", default_value = "./downloads")]
    /// Root folder underneath which downloaded tracks are placed.
    pub(crate) folder: std::path::PathBuf,

    #[arg(long, env = "EMBED_ALBUM_ART", default_value_t = true, action = clap::ArgAction::Set)]
    /// Embed the album cover into downloaded files.
    pub(crate) embed_art: bool,

    #[arg(long, env = "SAVE_ALBUM_ART", default_value_t = true, action = clap::ArgAction::Set)]
    /// Also store the album cover as a separate image file in each album
    /// folder.
    pub(crate) save_album_art: bool,

    #[arg(long, env = "ALBUM_ART_FILENAME", default_value = "cover.jpg")]
    /// File name of the separately stored album cover.
    pub(crate) album_art_filename: String,

    #[arg(long, env = "SKIP_EXISTING", default_value_t = true, action = clap::ArgAction::Set)]
    /// Do not download tracks whose destination file already exists.
    pub(crate) skip_existing: bool,

    #[arg(long, env = "MAX_CONCURRENT_DOWNLOADS", default_value_t = 3)]
    /// Number of tracks downloaded at the same time.
    pub(crate) max_parallel: usize,

    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    /// Number of attempts a track gets when failing with a transient error.
    pub(crate) max_retries: u32,

    #[arg(long, env = "RATE_LIMIT_DELAY_MS", default_value_t = 1000)]
    /// Minimum spacing in milliseconds between two stream requests.
    pub(crate) rate_limit_delay_ms: u64,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 2000)]
    /// Backoff in milliseconds before the first retry, doubled on every
    /// further retry.
    pub(crate) retry_backoff_ms: u64,

    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 500)]
    /// How long an idle worker sleeps before looking for work again.
    pub(crate) poll_interval_ms: u64,

    #[arg(long, env = "ALBUM_FOLDER_TEMPLATE", default_value = "{artist}/{album} [{year}]")]
    /// Folder layout below the download folder. Placeholders: {artist},
    /// {album}, {year}, {quality}.
    pub(crate) album_folder_template: String,

    #[arg(long, env = "TRACK_FILE_TEMPLATE", default_value = "{track_number} - {title}")]
    /// File name without extension. Placeholders: {track_number}, {title},
    /// {artist}, {album}, {quality}.
    pub(crate) track_file_template: String,

    #[arg(long, env = "PLAYLIST_AS_COMPILATION", default_value_t = true, action = clap::ArgAction::Set)]
    /// Store playlists in a single folder named after the playlist and tag
    /// them as one compilation album.
    pub(crate) playlist_as_compilation: bool,

    #[arg(long, env = "COMPILATION_ARTIST", default_value = "Various Artists")]
    /// Album artist written into tracks of a playlist compilation.
    pub(crate) compilation_artist: String,
}

impl Config {
    /// Reject configurations the worker pool can't operate with.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::TooSmall("max-parallel"));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::TooSmall("max-retries"));
        }
        if self.folder.as_os_str().is_empty() {
            return Err(ConfigError::EmptyFolder);
        }
        if !self.track_file_template.contains("{title}") {
            return Err(ConfigError::Template(self.track_file_template.clone()));
        }
        if self.album_art_filename.is_empty()
            || crate::expander::sanitize_filename(&self.album_art_filename)
                != self.album_art_filename
        {
            return Err(ConfigError::ArtFilename(self.album_art_filename.clone()));
        }
        Ok(())
    }

    pub(crate) fn rate_limit_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub(crate) fn retry_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_backoff_ms)
    }

    pub(crate) fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

pub(crate) fn check_catalog_url(url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::CatalogUrl(url.to_string()))
    }
}

#[cfg(test)]
pub(crate) fn test_config(folder: &std::path::Path) -> Config {
    use clap::Parser;

    let Ok(mut config) = Config::try_parse_from(["trackdl"]) else {
        panic!("default configuration failed to parse");
    };
    config.folder = folder.to_path_buf();
    config.rate_limit_delay_ms = 0;
    config.retry_backoff_ms = 1;
    config.poll_interval_ms = 10;
    config
}
