use std::sync::{Arc, Mutex};

use crate::builder::{BuildPolicy, JobBuilder};
use crate::config::{AppPaths, Config};
use crate::deps::LocalResolver;
use crate::jobs::JobController;
use crate::settings::{SettingsStore, SharedSettings};

// --- Modules ---
pub mod builder;
pub mod config;
pub mod crypto;
pub mod deps;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod session;
pub mod settings;

/// Everything the HTTP handlers and CLI commands share.
#[derive(Clone)]
pub struct AppState {
    pub settings: SharedSettings,
    pub jobs: Arc<JobController>,
}

impl AppState {
    /// Opens the settings store under `paths` and wires up a job controller.
    pub fn open(config: &Config, paths: &AppPaths) -> Self {
        let settings: SharedSettings = Arc::new(Mutex::new(SettingsStore::open_default(paths)));
        let resolver = Arc::new(LocalResolver::new(paths.dependencies_dir()));
        let builder = JobBuilder::new(BuildPolicy {
            fragment_retries: config.engine.retry_limit(),
        });
        let jobs = Arc::new(JobController::new(settings.clone(), resolver, builder));
        AppState { settings, jobs }
    }
}
