//! Turns a raw `JobOptions` into a validated `InvocationPlan`.
//!
//! Building is pure: no I/O, no clock, no environment. The same options and
//! policy always produce the same plan.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

use crate::error::ValidationError;
use crate::models::{JobOptions, MediaSelection, DEFAULT_FILENAME_TEMPLATE};
use crate::plan::{EngineFlag, InvocationPlan, PlaylistScope, PostProcessor, RetryLimit};

/// Quality label → maximum video height.
const VIDEO_HEIGHTS: &[(&str, u32)] = &[
    ("4K", 2160),
    ("2160p", 2160),
    ("1440p", 1440),
    ("1080p", 1080),
    ("720p", 720),
    ("480p", 480),
    ("360p", 360),
];

/// Quality label → ffmpeg VBR level (0 is best, 9 is worst).
const AUDIO_LEVELS: &[(&str, u8)] = &[
    ("最高", 0),
    ("best", 0),
    ("高", 2),
    ("high", 2),
    ("中", 5),
    ("medium", 5),
    ("低", 9),
    ("low", 9),
];

const UNCONSTRAINED_SELECTOR: &str = "best";
const AUDIO_SELECTOR: &str = "bestaudio/best";
const MERGE_CONTAINER: &str = "mp4";

static RATE_LIMIT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(?:\.\d+)?[kmgtpezy]?$").unwrap());

/// Knobs that are not part of a job's own options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildPolicy {
    /// Value used for fragment retries when a job asks for infinite retries.
    pub fragment_retries: RetryLimit,
}

impl Default for BuildPolicy {
    fn default() -> Self {
        BuildPolicy {
            fragment_retries: RetryLimit::Infinite,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    policy: BuildPolicy,
}

/// Builds a plan with the default policy.
pub fn build_plan(options: &JobOptions) -> Result<InvocationPlan, ValidationError> {
    JobBuilder::default().build(options)
}

impl JobBuilder {
    pub fn new(policy: BuildPolicy) -> Self {
        JobBuilder { policy }
    }

    pub fn policy(&self) -> BuildPolicy {
        self.policy
    }

    pub fn build(&self, options: &JobOptions) -> Result<InvocationPlan, ValidationError> {
        let url = options.url.trim();
        if url.is_empty() {
            return Err(ValidationError::new("url", "must not be empty"));
        }

        let playlist = playlist_scope(options)?;
        let mut flags = Vec::new();
        let mut postprocessors = Vec::new();

        let format_selector = match &options.media {
            MediaSelection::Video { quality, format } => {
                let container = format.trim().to_ascii_lowercase();
                if container.is_empty() || container == MERGE_CONTAINER {
                    flags.push(EngineFlag::MergeOutputFormat(MERGE_CONTAINER.to_string()));
                } else {
                    postprocessors.push(PostProcessor::ConvertVideo { container });
                }
                video_selector(quality)
            }
            MediaSelection::Audio { quality, format } => {
                let codec = match format.trim() {
                    "" => crate::models::DEFAULT_AUDIO_FORMAT.to_string(),
                    codec => codec.to_ascii_lowercase(),
                };
                postprocessors.push(PostProcessor::ExtractAudio {
                    codec,
                    quality: audio_level(quality),
                });
                AUDIO_SELECTOR.to_string()
            }
        };

        let subs = &options.subtitles;
        if subs.download {
            flags.push(EngineFlag::WriteSubtitles);
            if subs.auto_generated {
                flags.push(EngineFlag::WriteAutoSubtitles);
            }
            let languages: Vec<String> = subs
                .languages
                .iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if !languages.is_empty() {
                flags.push(EngineFlag::SubtitleLanguages(languages));
            }
            if subs.embed {
                postprocessors.push(PostProcessor::EmbedSubtitles);
            }
            if let Some(format) = chosen(subs.convert_to.as_deref()) {
                postprocessors.push(PostProcessor::ConvertSubtitles { format });
            }
        }

        if options.thumbnail.download {
            flags.push(EngineFlag::WriteThumbnail);
        }
        // The engine fetches the thumbnail itself when only embedding is requested.
        if options.thumbnail.embed {
            postprocessors.push(PostProcessor::EmbedThumbnail);
        }

        if options.metadata.embed_metadata {
            postprocessors.push(PostProcessor::EmbedMetadata);
        }
        if options.metadata.write_info_json {
            flags.push(EngineFlag::WriteInfoJson);
        }

        let net = &options.network;
        if let Some(rate) = trimmed(net.rate_limit.as_deref()) {
            if !RATE_LIMIT_REGEX.is_match(&rate) {
                return Err(ValidationError::new(
                    "rate_limit",
                    format!("'{}' is not a rate such as 50K or 4.2M", rate),
                ));
            }
            flags.push(EngineFlag::RateLimit(rate));
        }
        if let Some(n) = parse_positive("concurrent_fragments", net.concurrent_fragments.as_deref())? {
            flags.push(EngineFlag::ConcurrentFragments(n));
        }
        if net.infinite_retries {
            flags.push(EngineFlag::FragmentRetries(self.policy.fragment_retries));
        }
        if let Some(proxy) = trimmed(net.proxy.as_deref()) {
            flags.push(EngineFlag::Proxy(proxy));
        }
        if let Some(browser) = chosen(net.cookies_from_browser.as_deref()) {
            flags.push(EngineFlag::CookiesFromBrowser(browser));
        }

        let fs = &options.filesystem;
        if fs.no_part {
            flags.push(EngineFlag::NoPart);
        }
        if fs.restrict_filenames {
            flags.push(EngineFlag::RestrictFilenames);
        }
        if !fs.preserve_mtime {
            flags.push(EngineFlag::NoMtime);
        }

        if playlist.is_playlist() {
            if options.playlist.reverse {
                flags.push(EngineFlag::PlaylistReverse);
            }
            if options.playlist.random {
                flags.push(EngineFlag::PlaylistRandom);
            }
        }

        let output_dir = if options.output_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            options.output_dir.clone()
        };
        let template = match options.filename_template.trim() {
            "" => DEFAULT_FILENAME_TEMPLATE,
            t => t,
        };
        let output_template = output_dir.join(template).to_string_lossy().to_string();

        Ok(InvocationPlan {
            url: url.to_string(),
            kind: options.media.kind(),
            quality_label: options.media.quality().to_string(),
            output_dir,
            output_template,
            format_selector,
            playlist,
            flags,
            postprocessors,
        })
    }
}

/// Selector for a quality label; unknown labels fall back to `best`.
pub fn video_selector(quality: &str) -> String {
    let label = quality.trim();
    match VIDEO_HEIGHTS.iter().find(|(name, _)| name.eq_ignore_ascii_case(label)) {
        Some((_, h)) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
        None => UNCONSTRAINED_SELECTOR.to_string(),
    }
}

/// Encoder quality level for an audio label; unknown labels map to the best level.
pub fn audio_level(quality: &str) -> u8 {
    let label = quality.trim();
    AUDIO_LEVELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(label))
        .map(|(_, level)| *level)
        .unwrap_or(0)
}

/// Parses a comma separated item selection such as "2,4,7".
pub fn parse_item_selection(raw: &str) -> Result<Vec<u32>, ValidationError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ValidationError::new("playlist_items", format!("'{}' is not a positive integer", s)))
        })
        .collect()
}

fn playlist_scope(options: &JobOptions) -> Result<PlaylistScope, ValidationError> {
    let playlist = &options.playlist;
    if !playlist.enabled {
        return Ok(PlaylistScope::Single);
    }

    if !playlist.items.is_empty() {
        let mut indices: Vec<u32> = Vec::with_capacity(playlist.items.len());
        for &index in &playlist.items {
            if index == 0 {
                return Err(ValidationError::new("playlist_items", "indices are 1-based"));
            }
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        return Ok(PlaylistScope::Items { indices });
    }

    let start = parse_positive("playlist_start", playlist.start.as_deref())?.unwrap_or(1);
    let end = parse_positive("playlist_end", playlist.end.as_deref())?;
    if let Some(end) = end {
        if end < start {
            return Err(ValidationError::new(
                "playlist_end",
                format!("{} is before playlist_start {}", end, start),
            ));
        }
    }
    Ok(PlaylistScope::Range { start, end })
}

fn parse_positive(field: &'static str, raw: Option<&str>) -> Result<Option<u32>, ValidationError> {
    let Some(text) = trimmed(raw) else {
        return Ok(None);
    };
    match text.parse::<u32>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ValidationError::new(
            field,
            format!("'{}' is not a positive integer", text),
        )),
    }
}

pub(crate) fn trimmed(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Like `trimmed`, but also treats the "none" choices of a picker as unset.
pub(crate) fn chosen(value: Option<&str>) -> Option<String> {
    trimmed(value).filter(|v| v != "なし" && !v.eq_ignore_ascii_case("none"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(url: &str) -> JobOptions {
        JobOptions {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn quality_table_caps_height() {
        assert_eq!(
            video_selector("720p"),
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(
            video_selector("4k"),
            "bestvideo[height<=2160]+bestaudio/best[height<=2160]"
        );
        assert_eq!(video_selector("8K"), "best");
        assert_eq!(video_selector(""), "best");
    }

    #[test]
    fn audio_levels_cover_four_steps() {
        assert_eq!(audio_level("最高"), 0);
        assert_eq!(audio_level("高"), 2);
        assert_eq!(audio_level("中"), 5);
        assert_eq!(audio_level("低"), 9);
        assert_eq!(audio_level("Medium"), 5);
        assert_eq!(audio_level("ultra"), 0);
    }

    #[test]
    fn blank_url_is_rejected() {
        let err = build_plan(&options("   ")).unwrap_err();
        assert_eq!(err.field, "url");
    }

    #[test]
    fn non_mp4_container_adds_recode_step() {
        let mut opts = options("https://example.com/v");
        opts.media = MediaSelection::Video {
            quality: "1080p".to_string(),
            format: "mkv".to_string(),
        };
        let plan = build_plan(&opts).unwrap();
        assert_eq!(plan.merge_container(), None);
        assert_eq!(
            plan.postprocessors,
            vec![PostProcessor::ConvertVideo { container: "mkv".to_string() }]
        );
    }

    #[test]
    fn subtitle_options_are_inert_unless_downloading() {
        let mut opts = options("https://example.com/v");
        opts.subtitles.embed = true;
        opts.subtitles.convert_to = Some("srt".to_string());
        let plan = build_plan(&opts).unwrap();
        assert!(!plan.flags.contains(&EngineFlag::WriteSubtitles));
        assert!(!plan.postprocessors.contains(&PostProcessor::EmbedSubtitles));

        opts.subtitles.download = true;
        opts.subtitles.auto_generated = true;
        let plan = build_plan(&opts).unwrap();
        assert!(plan.flags.contains(&EngineFlag::WriteSubtitles));
        assert!(plan.flags.contains(&EngineFlag::WriteAutoSubtitles));
        assert!(plan.flags.contains(&EngineFlag::SubtitleLanguages(vec![
            "ja".to_string(),
            "en".to_string()
        ])));
        assert!(plan.postprocessors.contains(&PostProcessor::EmbedSubtitles));
        assert!(plan
            .postprocessors
            .contains(&PostProcessor::ConvertSubtitles { format: "srt".to_string() }));
    }

    #[test]
    fn none_choices_are_ignored() {
        let mut opts = options("https://example.com/v");
        opts.subtitles.download = true;
        opts.subtitles.convert_to = Some("なし".to_string());
        opts.network.cookies_from_browser = Some("None".to_string());
        let plan = build_plan(&opts).unwrap();
        assert!(!plan
            .postprocessors
            .iter()
            .any(|p| matches!(p, PostProcessor::ConvertSubtitles { .. })));
        assert!(!plan
            .flags
            .iter()
            .any(|f| matches!(f, EngineFlag::CookiesFromBrowser(_))));
    }

    #[test]
    fn embed_thumbnail_without_download_is_valid() {
        let mut opts = options("https://example.com/v");
        opts.thumbnail.embed = true;
        let plan = build_plan(&opts).unwrap();
        assert!(plan.postprocessors.contains(&PostProcessor::EmbedThumbnail));
        assert!(!plan.flags.contains(&EngineFlag::WriteThumbnail));
    }

    #[test]
    fn infinite_retries_follow_policy() {
        let mut opts = options("https://example.com/v");
        opts.network.infinite_retries = true;

        let plan = build_plan(&opts).unwrap();
        assert!(plan.flags.contains(&EngineFlag::FragmentRetries(RetryLimit::Infinite)));

        let capped = JobBuilder::new(BuildPolicy {
            fragment_retries: RetryLimit::Limited(25),
        });
        let plan = capped.build(&opts).unwrap();
        assert!(plan.flags.contains(&EngineFlag::FragmentRetries(RetryLimit::Limited(25))));
    }

    #[test]
    fn numeric_fields_must_be_positive() {
        let mut opts = options("https://example.com/v");
        opts.network.concurrent_fragments = Some("0".to_string());
        assert_eq!(build_plan(&opts).unwrap_err().field, "concurrent_fragments");

        opts.network.concurrent_fragments = Some("four".to_string());
        assert_eq!(build_plan(&opts).unwrap_err().field, "concurrent_fragments");

        opts.network.concurrent_fragments = Some(" 4 ".to_string());
        let plan = build_plan(&opts).unwrap();
        assert!(plan.flags.contains(&EngineFlag::ConcurrentFragments(4)));
    }

    #[test]
    fn playlist_range_is_validated() {
        let mut opts = options("https://example.com/list");
        opts.playlist.enabled = true;
        opts.playlist.start = Some("abc".to_string());
        assert_eq!(build_plan(&opts).unwrap_err().field, "playlist_start");

        opts.playlist.start = Some("5".to_string());
        opts.playlist.end = Some("3".to_string());
        assert_eq!(build_plan(&opts).unwrap_err().field, "playlist_end");
    }

    #[test]
    fn playlist_defaults_to_open_range() {
        let mut opts = options("https://example.com/list");
        opts.playlist.enabled = true;
        let plan = build_plan(&opts).unwrap();
        assert_eq!(plan.playlist, PlaylistScope::Range { start: 1, end: None });
    }

    #[test]
    fn reverse_and_random_only_apply_to_playlists() {
        let mut opts = options("https://example.com/list");
        opts.playlist.reverse = true;
        opts.playlist.random = true;
        let plan = build_plan(&opts).unwrap();
        assert!(!plan.flags.contains(&EngineFlag::PlaylistReverse));

        opts.playlist.enabled = true;
        let plan = build_plan(&opts).unwrap();
        assert!(plan.flags.contains(&EngineFlag::PlaylistReverse));
        assert!(plan.flags.contains(&EngineFlag::PlaylistRandom));
    }

    #[test]
    fn selection_is_deduplicated_and_rejects_zero() {
        let mut opts = options("https://example.com/list");
        opts.playlist.enabled = true;
        opts.playlist.items = vec![4, 2, 4];
        let plan = build_plan(&opts).unwrap();
        assert_eq!(plan.playlist, PlaylistScope::Items { indices: vec![4, 2] });

        opts.playlist.items = vec![0];
        assert_eq!(build_plan(&opts).unwrap_err().field, "playlist_items");
    }

    #[test]
    fn item_selection_text_parses() {
        assert_eq!(parse_item_selection("2, 4,,7").unwrap(), vec![2, 4, 7]);
        assert_eq!(parse_item_selection("2,x").unwrap_err().field, "playlist_items");
    }

    #[test]
    fn rate_limit_shape_is_checked() {
        let mut opts = options("https://example.com/v");
        opts.network.rate_limit = Some("4.2M".to_string());
        assert!(build_plan(&opts)
            .unwrap()
            .flags
            .contains(&EngineFlag::RateLimit("4.2M".to_string())));

        opts.network.rate_limit = Some("fast".to_string());
        assert_eq!(build_plan(&opts).unwrap_err().field, "rate_limit");
    }

    #[test]
    fn filesystem_switches_map_to_flags() {
        let mut opts = options("https://example.com/v");
        opts.filesystem.no_part = true;
        opts.filesystem.restrict_filenames = true;
        opts.filesystem.preserve_mtime = false;
        let plan = build_plan(&opts).unwrap();
        for flag in [EngineFlag::NoPart, EngineFlag::RestrictFilenames, EngineFlag::NoMtime] {
            assert!(plan.flags.contains(&flag), "missing {:?}", flag);
        }
    }

    #[test]
    fn output_template_joins_directory() {
        let mut opts = options("https://example.com/v");
        opts.output_dir = PathBuf::from("/data/videos");
        opts.filename_template = " ".to_string();
        let plan = build_plan(&opts).unwrap();
        assert_eq!(
            PathBuf::from(&plan.output_template),
            PathBuf::from("/data/videos").join("%(title)s.%(ext)s")
        );
    }
}
