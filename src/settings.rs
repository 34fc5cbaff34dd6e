//! Encrypted key-value settings with a bounded download history.
//!
//! The store never fails its caller: unreadable files fall back to the default
//! schema and failed saves are logged and reported as `false`.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{default_download_dir, AppPaths};
use crate::crypto::{self, SettingsCipher};
use crate::error::ValidationError;
use crate::models::{
    HistoryEntry, JobKind, JobOptions, MediaSelection, NetworkOptions, PlaylistOptions,
    SubtitleOptions, ThumbnailOptions, DEFAULT_AUDIO_FORMAT, DEFAULT_AUDIO_QUALITY,
    DEFAULT_FILENAME_TEMPLATE, DEFAULT_VIDEO_FORMAT, DEFAULT_VIDEO_QUALITY,
};

pub const HISTORY_KEY: &str = "download_history";
pub const HISTORY_LIMIT: usize = 100;
pub const DEFAULT_HISTORY_VIEW: usize = 50;

/// Keys whose values are masked whenever settings leave the process over HTTP.
pub const SECRET_KEYS: &[&str] = &["proxy"];
pub const REDACTED: &str = "********";
/// Keys only the local CLI may change. `download_path` also bounds what `/files` serves.
pub const LOCAL_ONLY_KEYS: &[&str] = &["download_path", HISTORY_KEY];

/// The store is the only object shared between jobs; every writer goes through this lock.
pub type SharedSettings = Arc<Mutex<SettingsStore>>;

pub fn lock_settings(settings: &SharedSettings) -> MutexGuard<'_, SettingsStore> {
    settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The recognized keys and their defaults.
pub fn default_settings() -> Map<String, Value> {
    let defaults = json!({
        "download_path": default_download_dir().to_string_lossy(),
        "video_quality": DEFAULT_VIDEO_QUALITY,
        "audio_quality": DEFAULT_AUDIO_QUALITY,
        "video_format": DEFAULT_VIDEO_FORMAT,
        "audio_format": DEFAULT_AUDIO_FORMAT,
        "download_type": "video",
        "download_subtitles": false,
        "auto_subtitles": false,
        "subtitle_languages": ["ja", "en"],
        "download_thumbnail": false,
        "embed_thumbnail": false,
        "filename_template": DEFAULT_FILENAME_TEMPLATE,
        "playlist_mode": false,
        "playlist_start": 1,
        "playlist_end": null,
        "max_downloads": null,
        "proxy": null,
        "cookies_from_browser": null,
        HISTORY_KEY: [],
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Defaults underneath, loaded values on top. Unknown keys are kept.
pub fn merge_defaults(loaded: Map<String, Value>) -> Map<String, Value> {
    let mut merged = default_settings();
    merged.extend(loaded);
    merged
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    cipher: SettingsCipher,
    values: Map<String, Value>,
}

impl SettingsStore {
    /// Opens the store, deriving or loading the key from `key_path`.
    pub fn open(path: impl Into<PathBuf>, key_path: &Path) -> Self {
        let key = crypto::load_or_create_key(key_path);
        Self::open_with_cipher(path, SettingsCipher::new(&key))
    }

    pub fn open_default(paths: &AppPaths) -> Self {
        Self::open(paths.settings_file(), &paths.key_file())
    }

    pub fn open_with_cipher(path: impl Into<PathBuf>, cipher: SettingsCipher) -> Self {
        let path = path.into();
        let values = match read_values(&path, &cipher) {
            Ok(Some(loaded)) => merge_defaults(loaded),
            Ok(None) => default_settings(),
            Err(e) => {
                tracing::warn!(
                    "Failed to load settings from {}: {:#}; using defaults",
                    path.display(),
                    e
                );
                default_settings()
            }
        };
        SettingsStore { path, cipher, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.values.get(key).cloned().unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        self.values
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// The stored values with secrets masked. Unset secrets stay `null`.
    pub fn redacted_values(&self) -> Map<String, Value> {
        let mut values = self.values.clone();
        for key in SECRET_KEYS {
            if let Some(value) = values.get_mut(*key).filter(|v| !is_unset(v)) {
                *value = Value::from(REDACTED);
            }
        }
        values
    }

    /// Applies a settings patch from a remote client.
    ///
    /// Only recognized keys outside `LOCAL_ONLY_KEYS` are accepted, and the
    /// whole patch is refused if any key is not. A secret sent back as the
    /// mask leaves the stored value alone.
    pub fn apply_remote_update(&mut self, patch: Map<String, Value>) -> Result<(), ValidationError> {
        let known = default_settings();
        if let Some(key) = patch
            .keys()
            .find(|key| !known.contains_key(*key) || LOCAL_ONLY_KEYS.contains(&key.as_str()))
        {
            return Err(ValidationError::new(
                "settings",
                format!("`{}` cannot be changed over HTTP", key),
            ));
        }
        for (key, value) in patch {
            if SECRET_KEYS.contains(&key.as_str()) && value.as_str() == Some(REDACTED) {
                continue;
            }
            self.values.insert(key, value);
        }
        Ok(())
    }

    /// Writes the whole map, encrypted, via a temp file and rename.
    pub fn save(&self) -> bool {
        match self.write_values() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save settings to {}: {:#}", self.path.display(), e);
                false
            }
        }
    }

    fn write_values(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.values)?;
        let blob = self.cipher.encrypt(&json)?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("settings path has no file name"))?;
        let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(&blob)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        drop(file);
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    // === History ===

    /// Newest first, at most `limit` entries. Entries that no longer parse are skipped.
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.values
            .get(HISTORY_KEY)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .take(limit)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn history_len(&self) -> usize {
        self.values
            .get(HISTORY_KEY)
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    /// Inserts at the head, drops anything past the cap and persists.
    pub fn add_history(
        &mut self,
        url: &str,
        title: &str,
        file_path: &str,
        download_type: JobKind,
        quality: &str,
    ) -> bool {
        let entry = HistoryEntry::new(url, title, file_path, download_type, quality);
        let entry = match serde_json::to_value(&entry) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to encode history entry: {}", e);
                return false;
            }
        };

        let mut history = match self.values.remove(HISTORY_KEY) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        history.insert(0, entry);
        history.truncate(HISTORY_LIMIT);
        self.values.insert(HISTORY_KEY.to_string(), Value::Array(history));
        self.save()
    }

    pub fn clear_history(&mut self) -> bool {
        self.values.insert(HISTORY_KEY.to_string(), Value::Array(Vec::new()));
        self.save()
    }

    // === Job defaults ===

    /// Projects the stored preferences into a job for `url`.
    ///
    /// `kind` overrides the stored `download_type`, picking the matching quality/format pair.
    pub fn job_defaults(&self, url: &str, kind: Option<JobKind>) -> JobOptions {
        let kind = kind.unwrap_or(match self.get_str("download_type") {
            Some("audio") => JobKind::Audio,
            _ => JobKind::Video,
        });
        let text = |key: &str, fallback: &str| self.get_str(key).unwrap_or(fallback).to_string();

        let media = match kind {
            JobKind::Video => MediaSelection::Video {
                quality: text("video_quality", DEFAULT_VIDEO_QUALITY),
                format: text("video_format", DEFAULT_VIDEO_FORMAT),
            },
            JobKind::Audio => MediaSelection::Audio {
                quality: text("audio_quality", DEFAULT_AUDIO_QUALITY),
                format: text("audio_format", DEFAULT_AUDIO_FORMAT),
            },
        };

        let mut languages = self.get_string_list("subtitle_languages");
        if languages.is_empty() {
            languages = SubtitleOptions::default().languages;
        }

        JobOptions {
            url: url.to_string(),
            media,
            output_dir: self
                .get_str("download_path")
                .map(PathBuf::from)
                .unwrap_or_else(default_download_dir),
            filename_template: text("filename_template", DEFAULT_FILENAME_TEMPLATE),
            network: NetworkOptions {
                proxy: self.get_str("proxy").map(str::to_string),
                cookies_from_browser: self.get_str("cookies_from_browser").map(str::to_string),
                ..NetworkOptions::default()
            },
            subtitles: SubtitleOptions {
                download: self.get_bool("download_subtitles"),
                auto_generated: self.get_bool("auto_subtitles"),
                languages,
                ..SubtitleOptions::default()
            },
            thumbnail: ThumbnailOptions {
                download: self.get_bool("download_thumbnail"),
                embed: self.get_bool("embed_thumbnail"),
            },
            playlist: PlaylistOptions {
                enabled: self.get_bool("playlist_mode"),
                start: self.get("playlist_start").and_then(value_text),
                end: self.get("playlist_end").and_then(value_text),
                ..PlaylistOptions::default()
            },
            ..JobOptions::default()
        }
    }
}

fn is_unset(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn read_values(path: &Path, cipher: &SettingsCipher) -> Result<Option<Map<String, Value>>> {
    if !path.exists() {
        return Ok(None);
    }
    let blob = fs::read(path)?;
    let json = cipher.decrypt(&blob)?;
    match serde_json::from_str::<Value>(&json)? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(anyhow!("expected a JSON object, found {}", json_type(&other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
