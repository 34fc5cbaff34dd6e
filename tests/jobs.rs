#![cfg(unix)]

mod common;

use common::{item_line, out_dir, progress_line, spawn_guard, write_script};
use dlp_job_agent::builder::JobBuilder;
use dlp_job_agent::crypto::{SettingsCipher, KEY_LEN};
use dlp_job_agent::deps::LocalResolver;
use dlp_job_agent::error::JobError;
use dlp_job_agent::jobs::{JobController, JobStarted};
use dlp_job_agent::models::{JobKind, JobOptions};
use dlp_job_agent::session::{JobOutcome, SessionEvent};
use dlp_job_agent::settings::{lock_settings, SettingsStore, SharedSettings};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn controller(dir: &Path, engine_script: &str) -> (JobController, SharedSettings) {
    let deps = dir.join("deps");
    std::fs::create_dir_all(&deps).unwrap();
    write_script(&deps.join("yt-dlp"), engine_script);
    write_script(&deps.join("ffmpeg"), "exit 0\n");

    let settings: SharedSettings = Arc::new(Mutex::new(SettingsStore::open_with_cipher(
        dir.join("settings.dat"),
        SettingsCipher::new(&[9u8; KEY_LEN]),
    )));
    let resolver = Arc::new(LocalResolver::new(deps).with_search_path(None));
    let jobs = JobController::new(settings.clone(), resolver, JobBuilder::default());
    (jobs, settings)
}

fn options(dir: &Path) -> JobOptions {
    JobOptions {
        url: "https://example.com/watch?v=1".to_string(),
        output_dir: out_dir(dir),
        ..JobOptions::default()
    }
}

fn start(jobs: &JobController, options: &JobOptions) -> Result<JobStarted, JobError> {
    let _guard = spawn_guard();
    jobs.start(options)
}

async fn last_event(started: &mut JobStarted) -> Option<SessionEvent> {
    let mut last = None;
    while let Some(event) = started.events.recv().await {
        last = Some(event);
    }
    last
}

#[tokio::test]
async fn finished_job_lands_in_history() {
    let dir = tempfile::tempdir().unwrap();
    let file = out_dir(dir.path()).join("Clip.mp4");
    let script = format!("{}{}exit 0\n", progress_line(10, 10), item_line("Clip", &file));
    let (jobs, settings) = controller(dir.path(), &script);

    let mut started = start(&jobs, &options(dir.path())).unwrap();
    assert!(matches!(
        last_event(&mut started).await,
        Some(SessionEvent::Finished(JobOutcome::Succeeded(_)))
    ));

    let history = lock_settings(&settings).history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "Clip");
    assert_eq!(history[0].file_path, file.to_string_lossy());
    assert_eq!(history[0].download_type, JobKind::Video);
    assert_eq!(history[0].quality, "1080p");
}

#[tokio::test]
async fn second_job_is_refused_while_one_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (jobs, settings) = controller(dir.path(), "exec sleep 30\n");

    let mut started = start(&jobs, &options(dir.path())).unwrap();
    assert!(jobs.is_busy());
    assert!(matches!(start(&jobs, &options(dir.path())), Err(JobError::Busy)));

    assert!(jobs.cancel());
    assert_eq!(
        last_event(&mut started).await,
        Some(SessionEvent::Finished(JobOutcome::Cancelled))
    );
    assert!(!jobs.is_busy());
    assert_eq!(lock_settings(&settings).history_len(), 0);
}

#[tokio::test]
async fn failed_job_leaves_history_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let (jobs, settings) = controller(dir.path(), "echo 'ERROR: Unsupported URL' >&2\nexit 1\n");

    let mut started = start(&jobs, &options(dir.path())).unwrap();
    assert_eq!(
        last_event(&mut started).await,
        Some(SessionEvent::Finished(JobOutcome::Failed {
            reason: "Unsupported URL".to_string()
        }))
    );
    assert_eq!(lock_settings(&settings).history_len(), 0);
    assert!(jobs.status().is_some());
}
