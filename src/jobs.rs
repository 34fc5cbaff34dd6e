//! Runs at most one download at a time and records finished jobs in history.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::builder::JobBuilder;
use crate::deps::{resolve_engine, BinaryResolver};
use crate::error::JobError;
use crate::models::{JobKind, JobOptions};
use crate::session::{
    ExecutionSession, JobOutcome, JobReport, SessionEvent, SessionHandle,
    SessionSnapshot, SessionState,
};
use crate::settings::{lock_settings, SharedSettings};

const EVENT_BUFFER: usize = 64;

/// A job that was accepted and is now running.
pub struct JobStarted {
    pub handle: SessionHandle,
    /// Progress in arrival order, then exactly one `Finished`.
    pub events: mpsc::Receiver<SessionEvent>,
}

pub struct JobController {
    settings: SharedSettings,
    resolver: Arc<dyn BinaryResolver>,
    builder: JobBuilder,
    current: Mutex<Option<SessionHandle>>,
}

impl JobController {
    pub fn new(settings: SharedSettings, resolver: Arc<dyn BinaryResolver>, builder: JobBuilder) -> Self {
        JobController {
            settings,
            resolver,
            builder,
            current: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &dyn BinaryResolver {
        self.resolver.as_ref()
    }

    fn current(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.current()
            .as_ref()
            .is_some_and(|handle| handle.state() == SessionState::Running)
    }

    /// Validates, launches and starts forwarding events. Must run inside a tokio runtime.
    ///
    /// Refused with `JobError::Busy` while another session is running.
    pub fn start(&self, options: &JobOptions) -> Result<JobStarted, JobError> {
        let mut current = self.current();
        if current
            .as_ref()
            .is_some_and(|handle| handle.state() == SessionState::Running)
        {
            return Err(JobError::Busy);
        }

        let plan = self.builder.build(options)?;
        let binaries = resolve_engine(self.resolver.as_ref())?;
        let kind = plan.kind;
        let quality = plan.quality_label.clone();
        let url = plan.url.clone();

        let mut session = ExecutionSession::new(binaries);
        let (session_tx, mut session_rx) = mpsc::channel(EVENT_BUFFER);
        session.start(plan, session_tx)?;
        let handle = session.handle();
        *current = Some(handle.clone());
        drop(current);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let settings = self.settings.clone();
        tokio::spawn(async move {
            let mut listening = true;
            while let Some(event) = session_rx.recv().await {
                if let SessionEvent::Finished(JobOutcome::Succeeded(report)) = &event {
                    record_history(&settings, &url, kind, &quality, report);
                }
                if listening && tx.send(event).await.is_err() {
                    // Nobody is watching; keep draining so the session never blocks.
                    listening = false;
                }
            }
            session.wait().await;
        });

        Ok(JobStarted { handle, events: rx })
    }

    /// Requests cancellation of the running job. `false` when nothing is running.
    pub fn cancel(&self) -> bool {
        match self.current().as_ref() {
            Some(handle) if handle.state() == SessionState::Running => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the most recent session, if any has been started.
    pub fn status(&self) -> Option<SessionSnapshot> {
        self.current().as_ref().map(SessionHandle::snapshot)
    }
}

fn record_history(settings: &SharedSettings, url: &str, kind: JobKind, quality: &str, report: &JobReport) {
    let Some(first) = report.items.first() else {
        tracing::warn!("Download of {} finished without reporting any file", url);
        return;
    };
    let path = first.file_path.to_string_lossy();

    let (title, label) = if report.playlist {
        let title = report.playlist_title.as_deref().unwrap_or(&first.title);
        (title.to_string(), format!("Playlist ({} files)", report.items.len()))
    } else {
        (first.title.clone(), quality.to_string())
    };

    let mut store = lock_settings(settings);
    if !store.add_history(url, &title, &path, kind, &label) {
        tracing::warn!("History entry for {} was not persisted", url);
    }
}
