use crate::errors::TagWriteWarning;
use crate::jobs::TrackMeta;
use tracing::{Level, event};

#[async_trait::async_trait]
/// Writes title/artist/album/cover metadata into a finished audio file.
pub(crate) trait Tagger: Send + Sync {
    async fn tag(
        &self,
        path: &std::path::Path,
        meta: &TrackMeta,
        embed_art: bool,
    ) -> Result<(), TagWriteWarning>;
}

// Whether an `ffmpeg` executable can be called at all. Without one, files are
// left untagged.
pub(crate) fn ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .is_ok_and(|out| out.status.success())
}

#[derive(Clone, Debug, Default)]
/// Rewrites the container with `ffmpeg`, copying the audio stream untouched.
pub(crate) struct FfmpegTagger;

// Assemble the `ffmpeg` invocation that copies `input` to `output` with all
// metadata from `meta` set and, if requested and available, the cover
// attached as picture stream.
fn ffmpeg_args(
    input: &std::path::Path,
    output: &std::path::Path,
    meta: &TrackMeta,
    embed_art: bool,
) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = vec![
        "-y".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.into(),
    ];

    match meta.cover_url.as_deref().filter(|_| embed_art) {
        Some(cover) => {
            args.extend(
                [
                    "-i",
                    cover,
                    "-map",
                    "0:a",
                    "-map",
                    "1:0",
                    "-disposition:v:0",
                    "attached_pic",
                ]
                .map(std::ffi::OsString::from),
            );
        }
        None => args.extend(["-map", "0:a"].map(std::ffi::OsString::from)),
    }
    args.extend(["-c", "copy"].map(std::ffi::OsString::from));

    let track = match meta.total_tracks {
        Some(total) => format!("{}/{total}", meta.track_number),
        None => meta.track_number.to_string(),
    };
    let mut tags = vec![
        ("title", meta.title.clone()),
        ("artist", meta.artist.clone()),
        ("album", meta.album.clone()),
        ("track", track),
    ];
    if let Some(album_artist) = &meta.album_artist {
        tags.push(("album_artist", album_artist.clone()));
    }
    if let Some(year) = meta.year {
        tags.push(("date", year.to_string()));
    }
    for (key, value) in tags {
        args.push("-metadata".into());
        args.push(format!("{key}={value}").into());
    }

    args.push(output.into());
    args
}

#[async_trait::async_trait]
impl Tagger for FfmpegTagger {
    async fn tag(
        &self,
        path: &std::path::Path,
        meta: &TrackMeta,
        embed_art: bool,
    ) -> Result<(), TagWriteWarning> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Err(TagWriteWarning(format!("no file name in {path:?}")));
        };

        // Keep the extension so ffmpeg picks the same container for output.
        let tagged_path = path.with_file_name(format!(".tagging-{file_name}"));
        let args = ffmpeg_args(path, &tagged_path, meta, embed_art);
        event!(Level::DEBUG, "Tagging {path:?} via ffmpeg");

        let output = match tokio::process::Command::new("ffmpeg")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                return Err(TagWriteWarning(format!("failed to run ffmpeg: {e}")));
            }
        };

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tagged_path).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TagWriteWarning(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if let Err(e) = tokio::fs::rename(&tagged_path, path).await {
            let _ = tokio::fs::remove_file(&tagged_path).await;
            return Err(TagWriteWarning(format!(
                "failed to replace {path:?} with tagged copy: {e}"
            )));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
/// Leaves files as downloaded. Used when `ffmpeg` isn't installed.
pub(crate) struct NoopTagger;

#[async_trait::async_trait]
impl Tagger for NoopTagger {
    async fn tag(
        &self,
        path: &std::path::Path,
        _meta: &TrackMeta,
        _embed_art: bool,
    ) -> Result<(), TagWriteWarning> {
        event!(Level::DEBUG, "Not tagging {path:?}, no tagger available");
        Ok(())
    }
}
