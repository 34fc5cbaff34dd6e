//! The engine-ready description of one job.
//!
//! An `InvocationPlan` is produced by `builder::JobBuilder` and rendered into
//! yt-dlp arguments by `to_args`. Flags and post-processing steps keep the
//! order in which the builder appended them.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::models::JobKind;
use crate::progress::{ITEM_TEMPLATE, PLAYLIST_TEMPLATE, PROGRESS_TEMPLATE};

/// Upper bound for fragment retries.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryLimit {
    Infinite,
    Limited(u32),
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryLimit::Infinite => f.write_str("infinite"),
            RetryLimit::Limited(n) => write!(f, "{}", n),
        }
    }
}

/// A transformation the engine applies after retrieval (via ffmpeg).
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum PostProcessor {
    ExtractAudio { codec: String, quality: u8 },
    ConvertVideo { container: String },
    EmbedSubtitles,
    ConvertSubtitles { format: String },
    EmbedThumbnail,
    EmbedMetadata,
}

impl PostProcessor {
    pub fn name(&self) -> &'static str {
        match self {
            PostProcessor::ExtractAudio { .. } => "extract-audio",
            PostProcessor::ConvertVideo { .. } => "convert-video",
            PostProcessor::EmbedSubtitles => "embed-subtitles",
            PostProcessor::ConvertSubtitles { .. } => "convert-subtitles",
            PostProcessor::EmbedThumbnail => "embed-thumbnail",
            PostProcessor::EmbedMetadata => "embed-metadata",
        }
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            PostProcessor::ExtractAudio { codec, quality } => {
                args.push("--extract-audio".into());
                args.push("--audio-format".into());
                args.push(codec.clone());
                args.push("--audio-quality".into());
                args.push(quality.to_string());
            }
            PostProcessor::ConvertVideo { container } => {
                args.push("--recode-video".into());
                args.push(container.clone());
            }
            PostProcessor::EmbedSubtitles => args.push("--embed-subs".into()),
            PostProcessor::ConvertSubtitles { format } => {
                args.push("--convert-subs".into());
                args.push(format.clone());
            }
            PostProcessor::EmbedThumbnail => args.push("--embed-thumbnail".into()),
            PostProcessor::EmbedMetadata => args.push("--embed-metadata".into()),
        }
    }
}

/// A resolved engine switch that is not a post-processing step.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "flag", content = "value", rename_all = "kebab-case")]
pub enum EngineFlag {
    MergeOutputFormat(String),
    WriteSubtitles,
    WriteAutoSubtitles,
    SubtitleLanguages(Vec<String>),
    WriteThumbnail,
    WriteInfoJson,
    RateLimit(String),
    ConcurrentFragments(u32),
    FragmentRetries(RetryLimit),
    NoPart,
    RestrictFilenames,
    NoMtime,
    Proxy(String),
    CookiesFromBrowser(String),
    PlaylistReverse,
    PlaylistRandom,
}

impl EngineFlag {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            EngineFlag::MergeOutputFormat(container) => {
                args.push("--merge-output-format".into());
                args.push(container.clone());
            }
            EngineFlag::WriteSubtitles => args.push("--write-subs".into()),
            EngineFlag::WriteAutoSubtitles => args.push("--write-auto-subs".into()),
            EngineFlag::SubtitleLanguages(langs) => {
                args.push("--sub-langs".into());
                args.push(langs.join(","));
            }
            EngineFlag::WriteThumbnail => args.push("--write-thumbnail".into()),
            EngineFlag::WriteInfoJson => args.push("--write-info-json".into()),
            EngineFlag::RateLimit(rate) => {
                args.push("--limit-rate".into());
                args.push(rate.clone());
            }
            EngineFlag::ConcurrentFragments(n) => {
                args.push("--concurrent-fragments".into());
                args.push(n.to_string());
            }
            EngineFlag::FragmentRetries(limit) => {
                args.push("--fragment-retries".into());
                args.push(limit.to_string());
            }
            EngineFlag::NoPart => args.push("--no-part".into()),
            EngineFlag::RestrictFilenames => args.push("--restrict-filenames".into()),
            EngineFlag::NoMtime => args.push("--no-mtime".into()),
            EngineFlag::Proxy(url) => {
                args.push("--proxy".into());
                args.push(url.clone());
            }
            EngineFlag::CookiesFromBrowser(browser) => {
                args.push("--cookies-from-browser".into());
                args.push(browser.clone());
            }
            EngineFlag::PlaylistReverse => args.push("--playlist-reverse".into()),
            EngineFlag::PlaylistRandom => args.push("--playlist-random".into()),
        }
    }
}

/// Which entries of a URL the engine should fetch.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PlaylistScope {
    /// Only the single item behind the URL, even if it belongs to a playlist.
    Single,
    /// Inclusive 1-based range; `end: None` runs to the end of the playlist.
    Range { start: u32, end: Option<u32> },
    /// Exactly these 1-based items.
    Items { indices: Vec<u32> },
}

impl PlaylistScope {
    pub fn is_playlist(&self) -> bool {
        !matches!(self, PlaylistScope::Single)
    }

    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            PlaylistScope::Single => args.push("--no-playlist".into()),
            PlaylistScope::Range { start, end } => {
                args.push("--yes-playlist".into());
                args.push("--playlist-start".into());
                args.push(start.to_string());
                if let Some(end) = end {
                    args.push("--playlist-end".into());
                    args.push(end.to_string());
                }
            }
            PlaylistScope::Items { indices } => {
                let joined = indices.iter().map(u32::to_string).collect::<Vec<_>>().join(",");
                args.push("--yes-playlist".into());
                args.push("--playlist-items".into());
                args.push(joined);
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InvocationPlan {
    pub url: String,
    pub kind: JobKind,
    /// Label recorded in the history log, e.g. "1080p" or "最高".
    pub quality_label: String,
    pub output_dir: PathBuf,
    /// Full output template: `output_dir/filename_template`.
    pub output_template: String,
    pub format_selector: String,
    pub playlist: PlaylistScope,
    pub flags: Vec<EngineFlag>,
    pub postprocessors: Vec<PostProcessor>,
}

impl InvocationPlan {
    /// Container the engine merges separate video/audio streams into, if any.
    pub fn merge_container(&self) -> Option<&str> {
        self.flags.iter().find_map(|flag| match flag {
            EngineFlag::MergeOutputFormat(c) => Some(c.as_str()),
            _ => None,
        })
    }

    /// Renders the full yt-dlp argument list (without the program name).
    ///
    /// `transcoder` is passed through as `--ffmpeg-location` so post-processing
    /// never depends on a bare `ffmpeg` lookup.
    pub fn to_args(&self, transcoder: Option<&Path>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--encoding".into(),
            "utf-8".into(),
            "--progress".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            "--print".into(),
            ITEM_TEMPLATE.into(),
        ];
        if self.playlist.is_playlist() {
            args.push("--print".into());
            args.push(PLAYLIST_TEMPLATE.into());
        }
        args.push("--no-simulate".into());

        args.push("-f".into());
        args.push(self.format_selector.clone());
        args.push("-o".into());
        args.push(self.output_template.clone());

        self.playlist.push_args(&mut args);
        for flag in &self.flags {
            flag.push_args(&mut args);
        }
        for step in &self.postprocessors {
            step.push_args(&mut args);
        }
        if let Some(ffmpeg) = transcoder {
            args.push("--ffmpeg-location".into());
            args.push(ffmpeg.to_string_lossy().to_string());
        }

        args.push("--".into());
        args.push(self.url.clone());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> InvocationPlan {
        InvocationPlan {
            url: "https://example.com/watch?v=abc".to_string(),
            kind: JobKind::Audio,
            quality_label: "最高".to_string(),
            output_dir: PathBuf::from("/music"),
            output_template: "/music/%(title)s.%(ext)s".to_string(),
            format_selector: "bestaudio/best".to_string(),
            playlist: PlaylistScope::Items { indices: vec![2, 4] },
            flags: vec![EngineFlag::FragmentRetries(RetryLimit::Infinite), EngineFlag::NoMtime],
            postprocessors: vec![
                PostProcessor::ExtractAudio { codec: "mp3".to_string(), quality: 0 },
                PostProcessor::EmbedThumbnail,
            ],
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn args_end_with_url_after_separator() {
        let args = sample_plan().to_args(None);
        let n = args.len();
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "https://example.com/watch?v=abc");
    }

    #[test]
    fn args_carry_selector_template_and_steps() {
        let args = sample_plan().to_args(Some(Path::new("/opt/ffmpeg/ffmpeg")));
        assert_eq!(value_after(&args, "-f"), Some("bestaudio/best"));
        assert_eq!(value_after(&args, "-o"), Some("/music/%(title)s.%(ext)s"));
        assert_eq!(value_after(&args, "--playlist-items"), Some("2,4"));
        assert_eq!(value_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("0"));
        assert_eq!(value_after(&args, "--fragment-retries"), Some("infinite"));
        assert_eq!(value_after(&args, "--ffmpeg-location"), Some("/opt/ffmpeg/ffmpeg"));
        assert!(args.iter().any(|a| a == "--embed-thumbnail"));
        assert!(args.iter().any(|a| a == PLAYLIST_TEMPLATE));
        assert_eq!(value_after(&args, "--encoding"), Some("utf-8"));
    }

    #[test]
    fn single_item_scope_disables_playlists() {
        let mut plan = sample_plan();
        plan.playlist = PlaylistScope::Single;
        let args = plan.to_args(None);
        assert!(args.iter().any(|a| a == "--no-playlist"));
        assert!(!args.iter().any(|a| a == PLAYLIST_TEMPLATE));
    }

    #[test]
    fn open_ended_range_omits_end() {
        let mut plan = sample_plan();
        plan.playlist = PlaylistScope::Range { start: 1, end: None };
        let args = plan.to_args(None);
        assert_eq!(value_after(&args, "--playlist-start"), Some("1"));
        assert!(!args.iter().any(|a| a == "--playlist-end"));
    }
}
