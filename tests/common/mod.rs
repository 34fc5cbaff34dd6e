#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use dlp_job_agent::deps::EngineBinaries;

/// Writing a script while another test forks can leave the file busy for exec (ETXTBSY).
/// Every write and every spawn in a test binary goes through this lock.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

pub fn spawn_guard() -> MutexGuard<'static, ()> {
    SPAWN_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write_script(path: &Path, body: &str) {
    let _guard = spawn_guard();
    fs::write(path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// A fake yt-dlp (running `body`) and a do-nothing ffmpeg inside `dir`.
pub fn fake_engine(dir: &Path, body: &str) -> EngineBinaries {
    let retriever = dir.join("yt-dlp");
    let transcoder = dir.join("ffmpeg");
    write_script(&retriever, body);
    write_script(&transcoder, "exit 0\n");
    EngineBinaries { retriever, transcoder }
}

pub fn progress_line(downloaded: u64, total: u64) -> String {
    format!("echo '[progress] downloading|{}|{}|NA|1048576.0|3'\n", downloaded, total)
}

pub fn item_line(title: &str, path: &Path) -> String {
    format!("printf '[item] %s\\037%s\\n' '{}' '{}'\n", title, path.display())
}

pub fn out_dir(dir: &Path) -> PathBuf {
    dir.join("out")
}
