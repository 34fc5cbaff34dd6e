use anyhow::{anyhow, bail, Context};
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Args, Parser, Subcommand};
#[cfg(unix)]
use daemonize::Daemonize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};

use dlp_job_agent::{
    builder::parse_item_selection,
    config::{load_config, AppPaths, Config},
    deps::{dependency_report, resolve_engine},
    handlers,
    jobs::JobStarted,
    models::{JobKind, JobOptions, MediaSelection},
    probe::{self, ProbeOptions},
    session::{JobOutcome, SessionEvent},
    settings::{lock_settings, DEFAULT_HISTORY_VIEW, HISTORY_KEY},
    AppState,
};

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "Runs yt-dlp download jobs with encrypted settings and history.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manages the server process.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    /// Download a URL in the foreground. Ctrl-C cancels.
    Download(DownloadArgs),
    /// Show title, duration or playlist entries without downloading.
    Info {
        url: String,
        #[arg(long)]
        proxy: Option<String>,
        #[arg(long)]
        cookies_from_browser: Option<String>,
    },
    /// Show or clear the download history.
    History {
        #[arg(long, default_value_t = DEFAULT_HISTORY_VIEW)]
        limit: usize,
        #[arg(long)]
        clear: bool,
    },
    /// Read or change stored settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Report where yt-dlp and ffmpeg were found.
    Deps,
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the server as a background process.
    Start,
    /// Stop the background server process.
    Stop,
    /// Restart the background server process.
    Restart,
    /// Run the server in the foreground.
    Run,
    /// Check the status of the background server process.
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print every setting.
    Show,
    /// Print one setting.
    Get { key: String },
    /// Store a setting. The value is parsed as JSON, falling back to a plain string.
    Set { key: String, value: String },
}

/// Options not given on the command line come from the stored settings.
#[derive(Args, Debug)]
struct DownloadArgs {
    url: String,
    /// Extract audio instead of downloading video.
    #[arg(long, conflicts_with = "video")]
    audio: bool,
    /// Download video even when the stored default is audio.
    #[arg(long)]
    video: bool,
    /// e.g. 1080p, 720p, 4K for video; 最高/high/medium/low for audio.
    #[arg(long)]
    quality: Option<String>,
    /// Container (mp4, mkv, webm) or audio codec (mp3, m4a, opus).
    #[arg(long)]
    format: Option<String>,
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    template: Option<String>,

    /// Treat the URL as a playlist.
    #[arg(long)]
    playlist: bool,
    /// Explicit 1-based items, e.g. "2,4". Overrides --start/--end.
    #[arg(long)]
    items: Option<String>,
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    reverse: bool,
    #[arg(long)]
    random: bool,

    #[arg(long)]
    subs: bool,
    #[arg(long)]
    auto_subs: bool,
    #[arg(long)]
    embed_subs: bool,
    /// Comma-separated subtitle languages.
    #[arg(long, value_delimiter = ',')]
    sub_langs: Option<Vec<String>>,
    #[arg(long)]
    convert_subs: Option<String>,
    #[arg(long)]
    thumbnail: bool,
    #[arg(long)]
    embed_thumbnail: bool,

    /// e.g. 50K or 4.2M
    #[arg(long)]
    rate_limit: Option<String>,
    #[arg(long)]
    concurrent_fragments: Option<String>,
    #[arg(long)]
    infinite_retries: bool,
    #[arg(long)]
    proxy: Option<String>,
    #[arg(long)]
    cookies_from_browser: Option<String>,

    #[arg(long)]
    no_part: bool,
    #[arg(long)]
    restrict_filenames: bool,
    /// Do not set file times from the upload date.
    #[arg(long)]
    no_mtime: bool,
    #[arg(long)]
    embed_metadata: bool,
    #[arg(long)]
    write_info_json: bool,
}

impl DownloadArgs {
    /// The kind asked for on the command line; `None` defers to the stored `download_type`.
    fn kind(&self) -> Option<JobKind> {
        match (self.audio, self.video) {
            (true, _) => Some(JobKind::Audio),
            (_, true) => Some(JobKind::Video),
            _ => None,
        }
    }

    /// Overlays the flags that were given onto `options`.
    fn apply(self, options: &mut JobOptions) -> anyhow::Result<()> {
        if let Some(quality) = self.quality {
            set_quality(options, quality);
        }
        if let Some(format) = self.format {
            set_format(options, format);
        }
        if let Some(output) = self.output {
            options.output_dir = output;
        }
        if let Some(template) = self.template {
            options.filename_template = template;
        }

        let playlist = &mut options.playlist;
        playlist.enabled |= self.playlist || self.items.is_some();
        if let Some(items) = self.items {
            playlist.items = parse_item_selection(&items)?;
        }
        if self.start.is_some() {
            playlist.start = self.start;
        }
        if self.end.is_some() {
            playlist.end = self.end;
        }
        playlist.reverse |= self.reverse;
        playlist.random |= self.random;

        let subs = &mut options.subtitles;
        subs.download |= self.subs || self.auto_subs || self.embed_subs;
        subs.auto_generated |= self.auto_subs;
        subs.embed |= self.embed_subs;
        if let Some(languages) = self.sub_langs {
            subs.languages = languages;
        }
        if self.convert_subs.is_some() {
            subs.convert_to = self.convert_subs;
        }
        options.thumbnail.download |= self.thumbnail;
        options.thumbnail.embed |= self.embed_thumbnail;

        let network = &mut options.network;
        if self.rate_limit.is_some() {
            network.rate_limit = self.rate_limit;
        }
        if self.concurrent_fragments.is_some() {
            network.concurrent_fragments = self.concurrent_fragments;
        }
        network.infinite_retries |= self.infinite_retries;
        if self.proxy.is_some() {
            network.proxy = self.proxy;
        }
        if self.cookies_from_browser.is_some() {
            network.cookies_from_browser = self.cookies_from_browser;
        }

        options.filesystem.no_part |= self.no_part;
        options.filesystem.restrict_filenames |= self.restrict_filenames;
        if self.no_mtime {
            options.filesystem.preserve_mtime = false;
        }
        options.metadata.embed_metadata |= self.embed_metadata;
        options.metadata.write_info_json |= self.write_info_json;
        Ok(())
    }
}

fn set_quality(options: &mut JobOptions, value: String) {
    match &mut options.media {
        MediaSelection::Video { quality, .. } | MediaSelection::Audio { quality, .. } => *quality = value,
    }
}

fn set_format(options: &mut JobOptions, value: String) {
    match &mut options.media {
        MediaSelection::Video { format, .. } | MediaSelection::Audio { format, .. } => *format = value,
    }
}

// --- Main Application Logic ---
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Daemonizing forks, so it has to happen before the async runtime exists.
    if let Commands::Server { action } = &cli.command {
        match action {
            ServerAction::Start => return start_server(),
            ServerAction::Stop => return stop_server(),
            ServerAction::Restart => {
                stop_server()?;
                std::thread::sleep(std::time::Duration::from_secs(1));
                return start_server();
            }
            ServerAction::Status => return check_status(),
            ServerAction::Run => {}
        }
    }

    runtime()?.block_on(run_command(cli.command))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}

async fn run_command(command: Commands) -> anyhow::Result<()> {
    if !matches!(command, Commands::Server { .. }) {
        tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    }
    let config = load_config().await?;
    let paths = AppPaths::resolve(&config)?;

    match command {
        Commands::Server { .. } => run_server(&config, &paths).await,
        Commands::Download(args) => download(&config, &paths, args).await,
        Commands::Info { url, proxy, cookies_from_browser } => {
            let state = AppState::open(&config, &paths);
            let binaries = resolve_engine(state.jobs.resolver())?;
            let options = ProbeOptions { proxy, cookies_from_browser };
            let info = probe::probe(&binaries.retriever, &url, &options).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Commands::History { limit, clear } => {
            let state = AppState::open(&config, &paths);
            let mut store = lock_settings(&state.settings);
            if clear {
                if !store.clear_history() {
                    bail!("failed to save the cleared history");
                }
                println!("History cleared.");
                return Ok(());
            }
            for entry in store.history(limit) {
                println!(
                    "{}  [{} {}]  {}  ->  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.download_type,
                    entry.quality,
                    entry.title,
                    entry.file_path
                );
            }
            Ok(())
        }
        Commands::Config { action } => {
            let state = AppState::open(&config, &paths);
            let mut store = lock_settings(&state.settings);
            match action {
                ConfigAction::Show => println!("{}", serde_json::to_string_pretty(store.values())?),
                ConfigAction::Get { key } => {
                    let value = store.get(&key).ok_or_else(|| anyhow!("unknown setting `{}`", key))?;
                    println!("{}", serde_json::to_string_pretty(value)?);
                }
                ConfigAction::Set { key, value } => {
                    if key == HISTORY_KEY {
                        bail!("use `history --clear` to change the history");
                    }
                    let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
                    store.set(key, parsed);
                    if !store.save() {
                        bail!("failed to save settings");
                    }
                }
            }
            Ok(())
        }
        Commands::Deps => {
            let state = AppState::open(&config, &paths);
            for status in dependency_report(state.jobs.resolver()) {
                match &status.resolution.path {
                    Some(path) => println!("{:<8} {}", status.name, path.display()),
                    None => println!("{:<8} not installed", status.name),
                }
            }
            Ok(())
        }
    }
}

// --- Download Command ---

async fn download(config: &Config, paths: &AppPaths, args: DownloadArgs) -> anyhow::Result<()> {
    let state = AppState::open(config, paths);
    let mut options = lock_settings(&state.settings).job_defaults(&args.url, args.kind());
    args.apply(&mut options)?;

    let JobStarted { handle, mut events } = state.jobs.start(&options)?;
    let mut outcome = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Progress(progress)) => {
                    eprint!("\r{:<60}", progress.status_line());
                    let _ = std::io::stderr().flush();
                }
                Some(SessionEvent::Finished(finished)) => outcome = Some(finished),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !handle.is_cancelled() => {
                eprintln!("\nCancelling...");
                handle.cancel();
            }
        }
    }
    eprintln!();

    match outcome {
        Some(JobOutcome::Succeeded(report)) => {
            if let Some(title) = &report.playlist_title {
                println!("Playlist: {}", title);
            }
            for item in &report.items {
                println!("{}", item.file_path.display());
            }
            Ok(())
        }
        Some(JobOutcome::Failed { reason }) => bail!("download failed: {}", reason),
        Some(JobOutcome::Cancelled) => {
            println!("Download cancelled.");
            Ok(())
        }
        None => bail!("download ended without a result"),
    }
}

// --- Server Action Functions ---

/// The core function that runs the Axum web server.
async fn run_server(config: &Config, paths: &AppPaths) -> anyhow::Result<()> {
    // stderr, so a daemonized server logs into server.log
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let state = AppState::open(config, paths);
    let addr = config.server.bind_addr();
    let mut app = Router::new()
        .route("/config", get(handlers::get_config).post(handlers::update_config))
        .route("/info", get(handlers::media_info))
        .route("/download", post(handlers::start_download))
        .route("/status", get(handlers::get_status))
        .route("/cancel", post(handlers::cancel_download))
        .route("/history", get(handlers::list_history).delete(handlers::clear_history))
        .route("/deps", get(handlers::deps_status))
        .route("/files", get(handlers::list_files))
        .route("/files/*path", get(handlers::get_file));
    match handlers::cors_layer(&config.server.allowed_origins) {
        Some(cors) => app = app.layer(cors),
        None => tracing::info!("No CORS origins configured; cross-origin browser requests are refused"),
    }
    let app = app.with_state(state);
    tracing::info!("Starting server in foreground, listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Loads the configuration on a throwaway runtime, for the commands that must run before forking.
fn server_setup() -> anyhow::Result<(Config, AppPaths)> {
    let config = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(load_config())?;
    let paths = AppPaths::resolve(&config)?;
    Ok((config, paths))
}

/// Starts the server as a background process using platform-specific logic.
fn start_server() -> anyhow::Result<()> {
    let (config, paths) = server_setup()?;
    let pid_file = paths.pid_file();
    if is_running(&pid_file)? {
        println!("Server is already running.");
        return Ok(());
    }
    println!("Starting server in the background...");
    println!("PID file at: {}", pid_file.display());

    #[cfg(unix)]
    {
        let log_file = paths.data_dir().join("server.log");
        let stderr = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("failed to open {}", log_file.display()))?;
        Daemonize::new()
            .pid_file(&pid_file)
            .working_directory(paths.data_dir())
            .stderr(stderr)
            .start()
            .map_err(|e| anyhow!("failed to daemonize: {}", e))?;
        // From here on this is the detached process.
        runtime()?.block_on(run_server(&config, &paths))?;
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;

        let child = std::process::Command::new(std::env::current_exe()?)
            .arg("server")
            .arg("run")
            .creation_flags(CREATE_NO_WINDOW) // Prevents a console window from appearing
            .spawn()?;
        fs::write(&pid_file, child.id().to_string())?;
        println!("Server started, listening on {}.", config.server.bind_addr());
    }

    Ok(())
}

/// Stops the background server process.
fn stop_server() -> anyhow::Result<()> {
    let pid_file = server_setup()?.1.pid_file();
    let Some(pid) = read_pid(&pid_file)? else {
        println!("Server is not running (no PID file).");
        return Ok(());
    };
    let s = System::new_all();
    if let Some(process) = s.process(Pid::from_u32(pid)) {
        println!("Stopping server process with PID: {}", pid);
        process.kill();
    } else {
        println!("Process with PID {} not found. It may have already stopped.", pid);
    }
    fs::remove_file(&pid_file)?;
    println!("Server stopped.");
    Ok(())
}

/// Checks if the server process is running.
fn check_status() -> anyhow::Result<()> {
    let pid_file = server_setup()?.1.pid_file();
    match read_pid(&pid_file)? {
        Some(pid) if is_running(&pid_file)? => println!("Server is running with PID: {}", pid),
        _ => println!("Server is not running."),
    }
    Ok(())
}

// --- Helper Functions ---

fn read_pid(pid_file: &Path) -> anyhow::Result<Option<u32>> {
    if !pid_file.exists() {
        return Ok(None);
    }
    let pid_str = fs::read_to_string(pid_file)?;
    let pid = pid_str
        .trim()
        .parse()
        .with_context(|| format!("malformed PID file {}", pid_file.display()))?;
    Ok(Some(pid))
}

/// Checks if the server is running by checking the PID file and the process list.
fn is_running(pid_file: &Path) -> anyhow::Result<bool> {
    let Some(pid) = read_pid(pid_file)? else {
        return Ok(false);
    };
    let s = System::new_all();
    Ok(s.process(Pid::from_u32(pid)).is_some())
}
