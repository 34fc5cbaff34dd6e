//! Locates the two external binaries the engine needs.
//!
//! Installing them is someone else's job; this module only answers "is it
//! there, and where".

use serde::Serialize;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Binary {
    /// yt-dlp
    Retriever,
    /// ffmpeg
    Transcoder,
}

impl Binary {
    pub const ALL: [Binary; 2] = [Binary::Retriever, Binary::Transcoder];

    pub fn name(&self) -> &'static str {
        match self {
            Binary::Retriever => "yt-dlp",
            Binary::Transcoder => "ffmpeg",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.name(), env::consts::EXE_SUFFIX)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub installed: bool,
    pub path: Option<PathBuf>,
}

impl Resolution {
    pub fn found(path: PathBuf) -> Self {
        Resolution { installed: true, path: Some(path) }
    }

    pub fn missing() -> Self {
        Resolution { installed: false, path: None }
    }
}

pub trait BinaryResolver: Send + Sync {
    fn resolve(&self, binary: Binary) -> Resolution;

    /// Human-readable hint of where a missing binary should go.
    fn install_hint(&self) -> String {
        "the system PATH".to_string()
    }
}

/// Looks in the application's dependencies directory first, then on `PATH`.
#[derive(Debug, Clone)]
pub struct LocalResolver {
    dependencies_dir: PathBuf,
    search_path: Option<OsString>,
}

impl LocalResolver {
    pub fn new(dependencies_dir: impl Into<PathBuf>) -> Self {
        LocalResolver {
            dependencies_dir: dependencies_dir.into(),
            search_path: env::var_os("PATH"),
        }
    }

    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }
}

impl BinaryResolver for LocalResolver {
    fn resolve(&self, binary: Binary) -> Resolution {
        let file_name = binary.file_name();

        let bundled = self.dependencies_dir.join(&file_name);
        if is_executable(&bundled) {
            return Resolution::found(bundled);
        }

        if let Some(search_path) = &self.search_path {
            for dir in env::split_paths(search_path) {
                let candidate = dir.join(&file_name);
                if is_executable(&candidate) {
                    return Resolution::found(candidate);
                }
            }
        }

        Resolution::missing()
    }

    fn install_hint(&self) -> String {
        format!("{} or the system PATH", self.dependencies_dir.display())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Absolute paths of both binaries, resolved before a job starts.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct EngineBinaries {
    pub retriever: PathBuf,
    pub transcoder: PathBuf,
}

/// Resolves both binaries, failing on the first one that is missing.
pub fn resolve_engine(resolver: &dyn BinaryResolver) -> Result<EngineBinaries, SessionError> {
    let lookup = |binary: Binary| match resolver.resolve(binary) {
        Resolution { installed: true, path: Some(path) } => Ok(path),
        _ => Err(SessionError::BinaryMissing {
            binary: binary.name(),
            hint: resolver.install_hint(),
        }),
    };
    Ok(EngineBinaries {
        retriever: lookup(Binary::Retriever)?,
        transcoder: lookup(Binary::Transcoder)?,
    })
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DependencyStatus {
    pub binary: Binary,
    pub name: &'static str,
    #[serde(flatten)]
    pub resolution: Resolution,
}

pub fn dependency_report(resolver: &dyn BinaryResolver) -> Vec<DependencyStatus> {
    Binary::ALL
        .iter()
        .map(|binary| DependencyStatus {
            binary: *binary,
            name: binary.name(),
            resolution: resolver.resolve(*binary),
        })
        .collect()
}

/// `PATH` with `dir` prepended, so child processes find the transcoder.
pub fn search_path_with(dir: &Path) -> Option<OsString> {
    let current = env::var_os("PATH").unwrap_or_default();
    let mut dirs: Vec<PathBuf> = env::split_paths(&current).collect();
    if dirs.iter().any(|d| d == dir) {
        return None;
    }
    dirs.insert(0, dir.to_path_buf());
    env::join_paths(dirs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch_executable(path: &Path) {
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn bundled_binary_wins_over_path() {
        let deps = tempfile::tempdir().unwrap();
        let on_path = tempfile::tempdir().unwrap();
        touch_executable(&deps.path().join(Binary::Retriever.file_name()));
        touch_executable(&on_path.path().join(Binary::Retriever.file_name()));

        let resolver = LocalResolver::new(deps.path())
            .with_search_path(Some(on_path.path().as_os_str().to_os_string()));
        let resolution = resolver.resolve(Binary::Retriever);
        assert!(resolution.installed);
        assert_eq!(resolution.path, Some(deps.path().join(Binary::Retriever.file_name())));
    }

    #[test]
    fn falls_back_to_search_path() {
        let deps = tempfile::tempdir().unwrap();
        let on_path = tempfile::tempdir().unwrap();
        touch_executable(&on_path.path().join(Binary::Transcoder.file_name()));

        let resolver = LocalResolver::new(deps.path())
            .with_search_path(Some(on_path.path().as_os_str().to_os_string()));
        assert_eq!(
            resolver.resolve(Binary::Transcoder).path,
            Some(on_path.path().join(Binary::Transcoder.file_name()))
        );
    }

    #[test]
    fn missing_binary_fails_fast_with_its_name() {
        let deps = tempfile::tempdir().unwrap();
        touch_executable(&deps.path().join(Binary::Retriever.file_name()));
        let resolver = LocalResolver::new(deps.path()).with_search_path(None);

        let err = resolve_engine(&resolver).unwrap_err();
        match err {
            SessionError::BinaryMissing { binary, .. } => assert_eq!(binary, "ffmpeg"),
            other => panic!("unexpected {:?}", other),
        }

        let report = dependency_report(&resolver);
        assert!(report[0].resolution.installed);
        assert!(!report[1].resolution.installed);
    }
}
