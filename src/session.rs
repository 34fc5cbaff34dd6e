//! One external engine process, from launch to terminal outcome.
//!
//! ```text
//! Idle ──start──▶ Running ──▶ Succeeded | Failed | Cancelled
//! ```
//!
//! Progress and the terminal outcome travel over a bounded channel in arrival
//! order. Cancellation is a token: it is checked before every progress event
//! and also awaited alongside the output pump, so a silent engine is still
//! stopped promptly. yt-dlp offers no in-process hook to an external driver,
//! so observing the token terminates the child.

use serde::Serialize;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::deps::{search_path_with, EngineBinaries};
use crate::error::SessionError;
use crate::models::JobKind;
use crate::plan::InvocationPlan;
use crate::progress::{EngineLine, ProducedItem, ProgressSnapshot};

/// Lines of stderr kept for the failure reason when the engine prints no `ERROR:` line.
const STDERR_TAIL: usize = 20;
const LINE_BUFFER: usize = 256;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled)
    }
}

/// What a successful job produced.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct JobReport {
    pub playlist: bool,
    pub playlist_title: Option<String>,
    /// One entry per produced file. May be empty for a playlist with no matches.
    pub items: Vec<ProducedItem>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobOutcome {
    Succeeded(JobReport),
    Failed { reason: String },
    Cancelled,
}

impl JobOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            JobOutcome::Succeeded(_) => SessionState::Succeeded,
            JobOutcome::Failed { .. } => SessionState::Failed,
            JobOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Progress(ProgressSnapshot),
    /// Sent exactly once per started session, always last.
    Finished(JobOutcome),
}

/// Point-in-time view for status queries.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub url: Option<String>,
    pub kind: Option<JobKind>,
    pub state: SessionState,
    pub progress: Option<ProgressSnapshot>,
    pub outcome: Option<JobOutcome>,
}

#[derive(Debug, Default)]
struct Shared {
    url: Option<String>,
    kind: Option<JobKind>,
    state: SessionState,
    progress: Option<ProgressSnapshot>,
    outcome: Option<JobOutcome>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle for cancelling and inspecting a session from elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    token: CancellationToken,
    shared: Arc<Mutex<Shared>>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let shared = lock(&self.shared);
        SessionSnapshot {
            url: shared.url.clone(),
            kind: shared.kind,
            state: shared.state,
            progress: shared.progress.clone(),
            outcome: shared.outcome.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionSession {
    binaries: EngineBinaries,
    handle: SessionHandle,
    task: Option<JoinHandle<JobOutcome>>,
}

impl ExecutionSession {
    pub fn new(binaries: EngineBinaries) -> Self {
        ExecutionSession {
            binaries,
            handle: SessionHandle {
                token: CancellationToken::new(),
                shared: Arc::new(Mutex::new(Shared::default())),
            },
            task: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.handle.snapshot()
    }

    /// Launches the engine and returns immediately; must be called inside a tokio runtime.
    ///
    /// Progress and the final outcome arrive on `events`. A launch failure is
    /// returned here instead, and the session ends `Failed` without emitting events.
    pub fn start(
        &mut self,
        plan: InvocationPlan,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(), SessionError> {
        {
            let mut shared = lock(&self.handle.shared);
            if shared.state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            shared.state = SessionState::Running;
            shared.url = Some(plan.url.clone());
            shared.kind = Some(plan.kind);
        }

        let child = match self.spawn_engine(&plan) {
            Ok(child) => child,
            Err(err) => {
                let mut shared = lock(&self.handle.shared);
                shared.state = SessionState::Failed;
                shared.outcome = Some(JobOutcome::Failed { reason: err.to_string() });
                return Err(err);
            }
        };

        tracing::info!(
            "Engine started for {} (pid {:?})",
            plan.url,
            child.id()
        );

        self.task = Some(tokio::spawn(pump(
            child,
            plan.playlist.is_playlist(),
            events,
            self.handle.clone(),
        )));
        Ok(())
    }

    /// Waits for the terminal outcome. `None` if `start` was never called.
    pub async fn wait(&mut self) -> Option<JobOutcome> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    let outcome = JobOutcome::Failed {
                        reason: format!("engine task aborted: {}", e),
                    };
                    finish(&self.handle.shared, outcome.clone());
                    Some(outcome)
                }
            },
            None => lock(&self.handle.shared).outcome.clone(),
        }
    }

    fn spawn_engine(&self, plan: &InvocationPlan) -> Result<Child, SessionError> {
        std::fs::create_dir_all(&plan.output_dir).map_err(|source| SessionError::OutputDirectory {
            path: plan.output_dir.clone(),
            source,
        })?;

        let program = &self.binaries.retriever;
        let mut cmd = Command::new(program);
        cmd.args(plan.to_args(Some(&self.binaries.transcoder)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = self.binaries.transcoder.parent().and_then(search_path_with) {
            cmd.env("PATH", path);
        }
        configure_for_background(&mut cmd);

        cmd.spawn().map_err(|source| SessionError::Spawn {
            program: program.display().to_string(),
            source,
        })
    }
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    // Prevents a console window from appearing
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn configure_for_background(_cmd: &mut Command) {}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

struct RawLine {
    stream: Stream,
    text: String,
}

/// Accumulates everything the engine printed that matters for the outcome.
#[derive(Default)]
struct Collector {
    items: Vec<ProducedItem>,
    playlist_title: Option<String>,
    errors: Vec<String>,
    stderr_tail: Vec<String>,
}

impl Collector {
    fn failure_reason(&self, status: Option<ExitStatus>) -> String {
        if let Some(last) = self.errors.last() {
            return last.clone();
        }
        if let Some(last) = self.stderr_tail.iter().rev().find(|l| !l.trim().is_empty()) {
            return last.trim().to_string();
        }
        match status {
            Some(status) => format!("yt-dlp exited with {}", status),
            None => "yt-dlp terminated unexpectedly".to_string(),
        }
    }
}

fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::Sender<RawLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Raw byte frames: a line that is not valid UTF-8 is decoded lossily
        // and the pipe stays open until the engine closes it.
        let mut frames = FramedRead::new(reader, AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec()));
        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!("Stopped reading yt-dlp output: {}", err);
                    break;
                }
            };
            let text = String::from_utf8_lossy(&frame).trim_end_matches('\r').to_string();
            if tx.send(RawLine { stream, text }).await.is_err() {
                break;
            }
        }
    })
}

enum PumpEnd {
    Drained,
    Cancelled,
}

async fn pump(
    mut child: Child,
    playlist: bool,
    events: mpsc::Sender<SessionEvent>,
    handle: SessionHandle,
) -> JobOutcome {
    let token = handle.token.clone();
    let (line_tx, mut line_rx) = mpsc::channel::<RawLine>(LINE_BUFFER);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Stream::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Stream::Stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut collector = Collector::default();
    let end = loop {
        let line = tokio::select! {
            biased;
            _ = token.cancelled() => break PumpEnd::Cancelled,
            line = line_rx.recv() => line,
        };
        let Some(line) = line else {
            break PumpEnd::Drained;
        };

        match EngineLine::parse(&line.text) {
            EngineLine::Progress { status, snapshot } => {
                if token.is_cancelled() {
                    break PumpEnd::Cancelled;
                }
                if status != "downloading" {
                    continue;
                }
                lock(&handle.shared).progress = Some(snapshot.clone());
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break PumpEnd::Cancelled,
                    sent = events.send(SessionEvent::Progress(snapshot)) => {
                        if sent.is_err() {
                            tracing::debug!("Progress receiver dropped; continuing without updates");
                        }
                    }
                }
            }
            EngineLine::Item(item) => {
                tracing::info!("Finished item '{}' -> {}", item.title, item.file_path.display());
                collector.items.push(item);
            }
            EngineLine::PlaylistTitle(title) => collector.playlist_title = Some(title),
            EngineLine::Error(message) => {
                tracing::warn!("yt-dlp reported: {}", message);
                collector.errors.push(message);
            }
            EngineLine::Other => {
                if matches!(line.stream, Stream::Stderr) {
                    if collector.stderr_tail.len() == STDERR_TAIL {
                        collector.stderr_tail.remove(0);
                    }
                    collector.stderr_tail.push(line.text);
                }
            }
        }
    };

    let outcome = match end {
        PumpEnd::Cancelled => terminate(&mut child).await,
        PumpEnd::Drained => {
            let status = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                status = child.wait() => Some(status),
            };
            match status {
                None => terminate(&mut child).await,
                Some(_) if token.is_cancelled() => JobOutcome::Cancelled,
                Some(Ok(status)) if status.success() => JobOutcome::Succeeded(JobReport {
                    playlist,
                    playlist_title: collector.playlist_title.take(),
                    items: std::mem::take(&mut collector.items),
                }),
                Some(Ok(status)) => JobOutcome::Failed {
                    reason: collector.failure_reason(Some(status)),
                },
                Some(Err(e)) => JobOutcome::Failed {
                    reason: format!("failed to wait on yt-dlp: {}", e),
                },
            }
        }
    };

    for reader in readers {
        reader.abort();
    }

    match &outcome {
        JobOutcome::Succeeded(report) => {
            tracing::info!("Download completed with {} item(s)", report.items.len())
        }
        JobOutcome::Failed { reason } => tracing::error!("Download failed: {}", reason),
        JobOutcome::Cancelled => tracing::info!("Download cancelled by user"),
    }

    finish(&handle.shared, outcome.clone());
    if events.send(SessionEvent::Finished(outcome.clone())).await.is_err() {
        tracing::debug!("Outcome receiver dropped before completion");
    }
    outcome
}

async fn terminate(child: &mut Child) -> JobOutcome {
    if let Err(e) = child.start_kill() {
        tracing::debug!("Engine already exited before kill: {}", e);
    }
    if let Err(e) = child.wait().await {
        tracing::warn!("Failed to reap cancelled engine: {}", e);
    }
    JobOutcome::Cancelled
}

fn finish(shared: &Mutex<Shared>, outcome: JobOutcome) {
    let mut shared = lock(shared);
    shared.state = outcome.state();
    shared.outcome = Some(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_prefers_engine_errors() {
        let mut collector = Collector::default();
        collector.stderr_tail.push("WARNING: something".to_string());
        assert_eq!(collector.failure_reason(None), "WARNING: something");

        collector.errors.push("Video unavailable".to_string());
        assert_eq!(collector.failure_reason(None), "Video unavailable");
    }

    #[test]
    fn failure_reason_falls_back_to_exit_status() {
        let collector = Collector::default();
        assert_eq!(collector.failure_reason(None), "yt-dlp terminated unexpectedly");
    }

    #[test]
    fn outcome_maps_to_terminal_state() {
        assert_eq!(JobOutcome::Cancelled.state(), SessionState::Cancelled);
        assert!(JobOutcome::Failed { reason: String::new() }.state().is_terminal());
        assert!(!SessionState::Running.is_terminal());
    }

    #[tokio::test]
    async fn unspawnable_engine_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = ExecutionSession::new(EngineBinaries {
            retriever: dir.path().join("does-not-exist"),
            transcoder: dir.path().join("ffmpeg"),
        });
        let plan = crate::builder::build_plan(&crate::models::JobOptions {
            url: "https://example.com/v".to_string(),
            output_dir: dir.path().join("out"),
            ..Default::default()
        })
        .unwrap();
        let (tx, mut rx) = mpsc::channel(8);

        let err = session.start(plan.clone(), tx.clone()).unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(session.start(plan, tx).unwrap_err(), SessionError::AlreadyStarted));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reader_decodes_invalid_bytes_and_keeps_going() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &'static [u8] = b"caf\xe9 title\r\n[item] next\nlast";
        spawn_reader(input, Stream::Stdout, tx).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.text);
        }
        assert_eq!(lines, vec!["caf\u{FFFD} title", "[item] next", "last"]);
    }
}
