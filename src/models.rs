use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::session::SessionSnapshot;

// === Job Options ===

/// What a job produces. Selects which half of `MediaSelection` applies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    Video,
    Audio,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Video => "video",
            JobKind::Audio => "audio",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_VIDEO_QUALITY: &str = "1080p";
pub const DEFAULT_VIDEO_FORMAT: &str = "mp4";
pub const DEFAULT_AUDIO_QUALITY: &str = "最高";
pub const DEFAULT_AUDIO_FORMAT: &str = "mp3";
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%(title)s.%(ext)s";

fn default_video_quality() -> String {
    DEFAULT_VIDEO_QUALITY.to_string()
}

fn default_video_format() -> String {
    DEFAULT_VIDEO_FORMAT.to_string()
}

fn default_audio_quality() -> String {
    DEFAULT_AUDIO_QUALITY.to_string()
}

fn default_audio_format() -> String {
    DEFAULT_AUDIO_FORMAT.to_string()
}

/// Video or audio sub-schema. Only the fields of the chosen kind exist.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaSelection {
    Video {
        /// e.g., "4K", "1080p", "720p"
        #[serde(default = "default_video_quality")]
        quality: String,
        /// Output container, e.g., "mp4", "mkv", "webm"
        #[serde(default = "default_video_format")]
        format: String,
    },
    Audio {
        /// "最高" / "高" / "中" / "低" (or best/high/medium/low)
        #[serde(default = "default_audio_quality")]
        quality: String,
        /// Target codec, e.g., "mp3", "m4a", "opus"
        #[serde(default = "default_audio_format")]
        format: String,
    },
}

impl Default for MediaSelection {
    fn default() -> Self {
        MediaSelection::Video {
            quality: default_video_quality(),
            format: default_video_format(),
        }
    }
}

impl MediaSelection {
    pub fn kind(&self) -> JobKind {
        match self {
            MediaSelection::Video { .. } => JobKind::Video,
            MediaSelection::Audio { .. } => JobKind::Audio,
        }
    }

    pub fn quality(&self) -> &str {
        match self {
            MediaSelection::Video { quality, .. } | MediaSelection::Audio { quality, .. } => quality,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SubtitleOptions {
    pub download: bool,
    pub auto_generated: bool,
    pub embed: bool,
    /// e.g., "srt", "vtt". "なし" or "none" means keep the original format.
    pub convert_to: Option<String>,
    pub languages: Vec<String>,
}

impl Default for SubtitleOptions {
    fn default() -> Self {
        SubtitleOptions {
            download: false,
            auto_generated: false,
            embed: false,
            convert_to: None,
            languages: vec!["ja".to_string(), "en".to_string()],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ThumbnailOptions {
    pub download: bool,
    pub embed: bool,
}

/// Playlist controls. Numeric fields hold the raw text the user typed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct PlaylistOptions {
    pub enabled: bool,
    #[serde(deserialize_with = "raw_text::deserialize")]
    pub start: Option<String>,
    #[serde(deserialize_with = "raw_text::deserialize")]
    pub end: Option<String>,
    /// Explicit 1-based item selection. Takes precedence over start/end.
    pub items: Vec<u32>,
    pub reverse: bool,
    pub random: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct NetworkOptions {
    /// e.g., "50K" or "4.2M"
    pub rate_limit: Option<String>,
    #[serde(deserialize_with = "raw_text::deserialize")]
    pub concurrent_fragments: Option<String>,
    pub infinite_retries: bool,
    pub proxy: Option<String>,
    /// Browser to read cookies from, e.g., "firefox". "なし" or "none" disables it.
    pub cookies_from_browser: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FilesystemOptions {
    pub no_part: bool,
    pub restrict_filenames: bool,
    /// Set the file's mtime from the upload date (engine default).
    pub preserve_mtime: bool,
}

impl Default for FilesystemOptions {
    fn default() -> Self {
        FilesystemOptions {
            no_part: false,
            restrict_filenames: false,
            preserve_mtime: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct MetadataOptions {
    pub embed_metadata: bool,
    pub write_info_json: bool,
}

/// The raw option set for one job, before validation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct JobOptions {
    pub url: String,
    pub media: MediaSelection,
    pub output_dir: PathBuf,
    pub filename_template: String,
    pub subtitles: SubtitleOptions,
    pub thumbnail: ThumbnailOptions,
    pub playlist: PlaylistOptions,
    pub network: NetworkOptions,
    pub filesystem: FilesystemOptions,
    pub metadata: MetadataOptions,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            url: String::new(),
            media: MediaSelection::default(),
            output_dir: PathBuf::from("."),
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            subtitles: SubtitleOptions::default(),
            thumbnail: ThumbnailOptions::default(),
            playlist: PlaylistOptions::default(),
            network: NetworkOptions::default(),
            filesystem: FilesystemOptions::default(),
            metadata: MetadataOptions::default(),
        }
    }
}

/// Accepts a JSON string, number or null for fields that are validated later.
mod raw_text {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
        })
    }
}

// === History ===

/// One completed download. Entries are never mutated after insertion.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub url: String,
    pub title: String,
    pub file_path: String,
    pub download_type: JobKind,
    pub quality: String,
    pub timestamp: DateTime<Local>,
}

impl HistoryEntry {
    pub fn new(url: &str, title: &str, file_path: &str, download_type: JobKind, quality: &str) -> Self {
        HistoryEntry {
            url: url.to_string(),
            title: title.to_string(),
            file_path: file_path.to_string(),
            download_type,
            quality: quality.to_string(),
            timestamp: Local::now(),
        }
    }
}

// === API Request/Response Models ===

/// The query parameters for a `GET /info` request.
#[derive(Deserialize, Debug)]
pub struct InfoRequest {
    pub url: String,
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
}

/// The query parameters for a `GET /history` request.
#[derive(Deserialize, Debug, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// The response sent after successfully starting a download.
#[derive(Serialize, Debug)]
pub struct DownloadResponse {
    pub message: String,
    pub status: SessionSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_kind_is_tagged() {
        let media: MediaSelection = serde_json::from_value(json!({ "kind": "audio" })).unwrap();
        assert_eq!(
            media,
            MediaSelection::Audio {
                quality: "最高".to_string(),
                format: "mp3".to_string()
            }
        );
        assert_eq!(media.kind(), JobKind::Audio);
    }

    #[test]
    fn numeric_fields_accept_text_or_numbers() {
        let playlist: PlaylistOptions =
            serde_json::from_value(json!({ "enabled": true, "start": 3, "end": "5" })).unwrap();
        assert_eq!(playlist.start.as_deref(), Some("3"));
        assert_eq!(playlist.end.as_deref(), Some("5"));
        assert!(playlist.items.is_empty());
    }

    #[test]
    fn empty_object_yields_defaults() {
        let options: JobOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, JobOptions::default());
        assert!(options.filesystem.preserve_mtime);
        assert_eq!(options.subtitles.languages, vec!["ja", "en"]);
    }
}
