//! Metadata lookup without downloading (`--flat-playlist --dump-single-json`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

use crate::builder::{chosen, trimmed};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run yt-dlp: {0}")]
    Launch(#[from] std::io::Error),
    #[error("yt-dlp could not read the URL: {0}")]
    Engine(String),
    #[error("unexpected yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProbeOptions {
    pub proxy: Option<String>,
    pub cookies_from_browser: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PlaylistEntry {
    /// 1-based position within the playlist.
    pub index: u32,
    pub title: String,
    pub duration: Option<f64>,
    pub url: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MediaInfo {
    Video {
        title: String,
        duration: Option<f64>,
        uploader: Option<String>,
        view_count: Option<u64>,
        thumbnail: Option<String>,
    },
    Playlist {
        title: String,
        entries: Vec<PlaylistEntry>,
    },
}

/// Arguments for a metadata lookup of `url`, ending with `-- url`.
pub fn lookup_args(url: &str, options: &ProbeOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--flat-playlist".into(),
        "--dump-single-json".into(),
        "--no-warnings".into(),
    ];
    if let Some(proxy) = trimmed(options.proxy.as_deref()) {
        args.push("--proxy".into());
        args.push(proxy);
    }
    if let Some(browser) = chosen(options.cookies_from_browser.as_deref()) {
        args.push("--cookies-from-browser".into());
        args.push(browser);
    }
    args.push("--".into());
    args.push(url.to_string());
    args
}

pub async fn probe(retriever: &Path, url: &str, options: &ProbeOptions) -> Result<MediaInfo, ProbeError> {
    let mut cmd = Command::new(retriever);
    cmd.args(lookup_args(url, options)).stdin(Stdio::null());

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
            .unwrap_or_else(|| format!("exited with {}", output.status));
        return Err(ProbeError::Engine(reason));
    }

    parse_info(&output.stdout)
}

pub fn parse_info(json: &[u8]) -> Result<MediaInfo, ProbeError> {
    let value: Value = serde_json::from_slice(json)?;
    let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);
    let title = text(&value, "title").unwrap_or_else(|| "Unknown".to_string());

    let is_playlist = value.get("_type").and_then(Value::as_str) == Some("playlist");
    if !is_playlist {
        return Ok(MediaInfo::Video {
            title,
            duration: value.get("duration").and_then(Value::as_f64),
            uploader: text(&value, "uploader"),
            view_count: value.get("view_count").and_then(Value::as_u64),
            thumbnail: text(&value, "thumbnail"),
        });
    }

    let entries = value
        .get("entries")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.is_object())
                .map(|(position, entry)| PlaylistEntry {
                    index: position as u32 + 1,
                    title: text(entry, "title").unwrap_or_else(|| "Unknown".to_string()),
                    duration: entry.get("duration").and_then(Value::as_f64),
                    url: text(entry, "url").or_else(|| text(entry, "webpage_url")),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(MediaInfo::Playlist { title, entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_args_skip_the_no_browser_choice() {
        for browser in ["なし", "None", " "] {
            let options = ProbeOptions {
                proxy: None,
                cookies_from_browser: Some(browser.to_string()),
            };
            let args = lookup_args("https://example.com/v", &options);
            assert!(!args.iter().any(|a| a == "--cookies-from-browser"), "{:?}", args);
        }
    }

    #[test]
    fn lookup_args_carry_proxy_and_browser() {
        let options = ProbeOptions {
            proxy: Some(" http://proxy.local:3128 ".to_string()),
            cookies_from_browser: Some("firefox".to_string()),
        };
        assert_eq!(
            lookup_args("https://example.com/v", &options),
            [
                "--flat-playlist",
                "--dump-single-json",
                "--no-warnings",
                "--proxy",
                "http://proxy.local:3128",
                "--cookies-from-browser",
                "firefox",
                "--",
                "https://example.com/v",
            ]
        );
    }

    #[test]
    fn single_video_metadata() {
        let json = br#"{
            "_type": "video",
            "title": "Demo",
            "duration": 212.0,
            "uploader": "Someone",
            "view_count": 1234,
            "thumbnail": "https://i.example.com/t.jpg"
        }"#;
        assert_eq!(
            parse_info(json).unwrap(),
            MediaInfo::Video {
                title: "Demo".to_string(),
                duration: Some(212.0),
                uploader: Some("Someone".to_string()),
                view_count: Some(1234),
                thumbnail: Some("https://i.example.com/t.jpg".to_string()),
            }
        );
    }

    #[test]
    fn playlist_entries_keep_their_positions() {
        let json = br#"{
            "_type": "playlist",
            "title": "Mix",
            "entries": [
                {"title": "One", "duration": 60, "url": "https://example.com/1"},
                null,
                {"title": "Three"}
            ]
        }"#;
        let MediaInfo::Playlist { title, entries } = parse_info(json).unwrap() else {
            panic!("expected playlist");
        };
        assert_eq!(title, "Mix");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].duration, Some(60.0));
        assert_eq!(entries[1].index, 3);
        assert_eq!(entries[1].url, None);
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(parse_info(b"not json"), Err(ProbeError::Parse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn engine_failure_reports_last_error_line() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("yt-dlp");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'ERROR: [generic] Unsupported URL' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = probe(&script, "https://example.com/x", &ProbeOptions::default())
            .await
            .unwrap_err();
        match err {
            ProbeError::Engine(reason) => assert_eq!(reason, "[generic] Unsupported URL"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
