//! yt-dlp output protocol.
//!
//! The session asks yt-dlp for a machine-readable progress line and one
//! printed line per finished item. Human-readable `[download]` lines are
//! still understood in case a wrapper script rewrites the template.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;

pub const PROGRESS_MARKER: &str = "[progress] ";
pub const ITEM_MARKER: &str = "[item] ";
pub const PLAYLIST_MARKER: &str = "[playlist] ";
/// Separates title and path in item lines. Neither normally contains it.
pub const FIELD_SEPARATOR: char = '\u{1f}';

pub const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";
pub const ITEM_TEMPLATE: &str = "after_move:[item] %(title)s\u{1f}%(filepath)s";
pub const PLAYLIST_TEMPLATE: &str = "playlist:[playlist] %(title)s";

static YTDLP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(?P<progress>[\d\.]+)%\s+of\s+~?\s*(?P<size>[\d\.]+\s*[KMGTP]?i?B)(?:\s+at\s+(?P<speed>\S+(?:\s?B/s)?))?\s+ETA\s+(?P<eta>[\d:]+|Unknown)").unwrap()
});

static SIZE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<value>[\d\.]+)\s*(?P<unit>[KMGTP]?)(?P<binary>i?)B$").unwrap());

/// Normalized progress of the item currently transferring.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct ProgressSnapshot {
    /// 0–100; 0 when the total size is unknown.
    pub percent: f64,
    pub downloaded_bytes: u64,
    /// Exact total, else the engine's estimate, else 0.
    pub total_bytes: u64,
    /// Bytes per second; 0 when unknown.
    pub speed: f64,
    /// Seconds remaining, if the engine knows.
    pub eta: Option<u64>,
}

impl ProgressSnapshot {
    pub fn new(downloaded_bytes: u64, total_bytes: u64, speed: f64, eta: Option<u64>) -> Self {
        let percent = if total_bytes > 0 {
            (downloaded_bytes as f64 / total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        ProgressSnapshot {
            percent,
            downloaded_bytes,
            total_bytes,
            speed,
            eta,
        }
    }

    /// One-line summary such as `42.0% | 1.25 MB/s | 1m 5s left`.
    pub fn status_line(&self) -> String {
        let mut line = format!("{:.1}% | {:.2} MB/s", self.percent, self.speed / 1024.0 / 1024.0);
        if let Some(eta) = self.eta.filter(|eta| *eta > 0) {
            line.push_str(" | ");
            line.push_str(&format_eta(eta));
            line.push_str(" left");
        }
        line
    }
}

pub fn format_eta(seconds: u64) -> String {
    if seconds >= 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// An item the engine finished writing.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProducedItem {
    pub title: String,
    pub file_path: PathBuf,
}

/// One classified line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineLine {
    Progress { status: String, snapshot: ProgressSnapshot },
    Item(ProducedItem),
    PlaylistTitle(String),
    Error(String),
    Other,
}

impl EngineLine {
    pub fn parse(line: &str) -> EngineLine {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
            return parse_template_progress(rest).unwrap_or(EngineLine::Other);
        }
        if let Some(rest) = line.strip_prefix(ITEM_MARKER) {
            let (title, path) = rest.split_once(FIELD_SEPARATOR).unwrap_or(("", rest));
            return EngineLine::Item(ProducedItem {
                title: title.to_string(),
                file_path: PathBuf::from(path),
            });
        }
        if let Some(rest) = line.strip_prefix(PLAYLIST_MARKER) {
            return EngineLine::PlaylistTitle(rest.to_string());
        }
        if let Some(rest) = line.strip_prefix("ERROR:") {
            return EngineLine::Error(rest.trim().to_string());
        }
        if let Some(caps) = YTDLP_REGEX.captures(line) {
            return parse_legacy_progress(&caps);
        }
        EngineLine::Other
    }
}

fn parse_template_progress(rest: &str) -> Option<EngineLine> {
    let fields: Vec<&str> = rest.split('|').map(str::trim).collect();
    if fields.len() != 6 {
        return None;
    }
    let downloaded = parse_number(fields[1]).unwrap_or(0.0) as u64;
    let total = parse_number(fields[2])
        .or_else(|| parse_number(fields[3]))
        .unwrap_or(0.0) as u64;
    let speed = parse_number(fields[4]).unwrap_or(0.0);
    let eta = parse_number(fields[5]).map(|eta| eta as u64);

    Some(EngineLine::Progress {
        status: fields[0].to_string(),
        snapshot: ProgressSnapshot::new(downloaded, total, speed, eta),
    })
}

fn parse_legacy_progress(caps: &regex::Captures<'_>) -> EngineLine {
    let percent: f64 = caps
        .name("progress")
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let total = caps.name("size").and_then(|m| parse_size(m.as_str())).unwrap_or(0);
    let speed = caps
        .name("speed")
        .and_then(|m| parse_size(m.as_str().trim_end_matches("/s")))
        .unwrap_or(0) as f64;
    let eta = caps.name("eta").and_then(|m| parse_clock(m.as_str()));

    let snapshot = ProgressSnapshot {
        percent: if total > 0 { percent.min(100.0) } else { 0.0 },
        downloaded_bytes: (total as f64 * percent / 100.0) as u64,
        total_bytes: total,
        speed,
        eta,
    };
    EngineLine::Progress {
        status: "downloading".to_string(),
        snapshot,
    }
}

/// yt-dlp prints `NA` (or `None`) for fields it does not know.
fn parse_number(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0)
}

/// Parses sizes such as `10.00MiB`, `512KiB` or `1.5GB`.
pub fn parse_size(text: &str) -> Option<u64> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let caps = SIZE_REGEX.captures(&compact)?;
    let value: f64 = caps.name("value")?.as_str().parse().ok()?;
    let base: f64 = if caps.name("binary").is_some_and(|m| !m.as_str().is_empty()) {
        1024.0
    } else {
        1000.0
    };
    let exponent = match caps.name("unit").map(|m| m.as_str()).unwrap_or("") {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => return None,
    };
    Some((value * base.powi(exponent)) as u64)
}

/// Parses `SS`, `MM:SS` or `HH:MM:SS`.
fn parse_clock(text: &str) -> Option<u64> {
    text.split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|n| acc * 60 + n))
}
