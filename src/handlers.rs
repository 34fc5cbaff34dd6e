use crate::{
    config::default_download_dir,
    deps::{dependency_report, resolve_engine},
    error::{AppError, JobError},
    models::{DownloadResponse, HistoryQuery, InfoRequest, JobKind, JobOptions},
    probe::{self, ProbeError, ProbeOptions},
    session::{SessionSnapshot, SessionState},
    settings::{lock_settings, DEFAULT_HISTORY_VIEW},
    AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    Json,
};
use percent_encoding::percent_decode_str;
use serde_json::{json, Value};
use std::path::PathBuf;
use tower_http::cors::{AllowOrigin, CorsLayer};
use walkdir::WalkDir;

// ===================================================================
//                          CONFIG HANDLERS
// ===================================================================

/// # GET /config - Returns the stored settings with secrets masked.
pub async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let values = lock_settings(&state.settings).redacted_values();
    Ok((StatusCode::OK, Json(values)))
}

/// # POST /config - Merges a JSON object into the settings and saves them.
///
/// `download_path` and the download history can only be changed locally;
/// a patch naming them, or any unknown key, is rejected as a whole.
pub async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let Value::Object(patch) = payload else {
        return Err(AppError::BadRequest("Settings must be a JSON object".to_string()));
    };

    let values = {
        let mut store = lock_settings(&state.settings);
        store
            .apply_remote_update(patch)
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        if !store.save() {
            return Err(AppError::Internal(anyhow::anyhow!("failed to save settings")));
        }
        store.redacted_values()
    };
    tracing::info!("Settings updated and saved.");
    Ok((StatusCode::OK, Json(values)))
}

// ===================================================================
//                          INFO HANDLER
// ===================================================================

/// # GET /info - Probes a URL for its title, or its playlist entries.
pub async fn media_info(
    State(state): State<AppState>,
    Query(params): Query<InfoRequest>,
) -> Result<impl IntoResponse, AppError> {
    if params.url.trim().is_empty() {
        return Err(AppError::BadRequest("URL parameter cannot be empty".to_string()));
    }
    let binaries = resolve_engine(state.jobs.resolver()).map_err(|e| AppError::job(e.into()))?;
    tracing::info!("Fetching info for URL: {}", params.url);

    let options = ProbeOptions {
        proxy: params.proxy,
        cookies_from_browser: params.cookies_from_browser,
    };
    let info = probe::probe(&binaries.retriever, params.url.trim(), &options)
        .await
        .map_err(|e| match e {
            ProbeError::Engine(reason) => AppError::YtDlp(reason),
            other => AppError::Internal(other.into()),
        })?;
    Ok((StatusCode::OK, Json(info)))
}

// ===================================================================
//                          DOWNLOAD HANDLERS
// ===================================================================

/// # POST /download - Starts a job from stored defaults overlaid with the request body.
///
/// The body is any subset of the job options, e.g.
/// `{"url": "...", "media": {"kind": "audio"}, "playlist": {"enabled": true}}`.
pub async fn start_download(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    if !patch.is_object() {
        return Err(AppError::BadRequest("Download request must be a JSON object".to_string()));
    }
    let kind = match patch.pointer("/media/kind") {
        Some(kind) => Some(
            serde_json::from_value::<JobKind>(kind.clone())
                .map_err(|e| AppError::BadRequest(format!("invalid media kind: {}", e)))?,
        ),
        None => None,
    };

    let defaults = lock_settings(&state.settings).job_defaults("", kind);
    let mut merged = serde_json::to_value(&defaults)?;
    merge_json(&mut merged, patch);
    let options: JobOptions = serde_json::from_value(merged)
        .map_err(|e| AppError::BadRequest(format!("invalid download request: {}", e)))?;

    let started = state.jobs.start(&options).map_err(|e| {
        if !matches!(e, JobError::Busy) {
            tracing::warn!("Download of {} refused: {}", options.url, e);
        }
        AppError::job(e)
    })?;
    // Status is polled over HTTP; nothing consumes the event stream here.
    drop(started.events);

    tracing::info!("Download started for {}", options.url);
    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse {
            message: "Download started successfully".to_string(),
            status: started.handle.snapshot(),
        }),
    ))
}

/// # GET /status - Returns the state and progress of the current (or last) job.
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.jobs.status().unwrap_or(SessionSnapshot {
        url: None,
        kind: None,
        state: SessionState::Idle,
        progress: None,
        outcome: None,
    });
    (StatusCode::OK, Json(snapshot))
}

/// # POST /cancel - Cancels the running job, if there is one.
pub async fn cancel_download(State(state): State<AppState>) -> impl IntoResponse {
    let cancelled = state.jobs.cancel();
    if cancelled {
        tracing::info!("Cancellation requested for the running download.");
    }
    (StatusCode::OK, Json(json!({ "cancelled": cancelled })))
}

// ===================================================================
//                          HISTORY & DEPENDENCY HANDLERS
// ===================================================================

/// # GET /history - Newest-first download history.
pub async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_VIEW);
    let history = lock_settings(&state.settings).history(limit);
    (StatusCode::OK, Json(history))
}

/// # DELETE /history
pub async fn clear_history(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    if !lock_settings(&state.settings).clear_history() {
        return Err(AppError::Internal(anyhow::anyhow!("failed to save cleared history")));
    }
    tracing::info!("Download history cleared.");
    Ok(StatusCode::NO_CONTENT)
}

/// # GET /deps - Where yt-dlp and ffmpeg were found, if at all.
pub async fn deps_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(dependency_report(state.jobs.resolver())))
}

// ===================================================================
//                          FILE HANDLERS
// ===================================================================

/// # GET /files - Lists all downloaded files.
pub async fn list_files(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let mut files = Vec::new();
    let download_dir = download_dir(&state);

    if !download_dir.exists() {
        return Ok(Json(files));
    }

    for entry in WalkDir::new(&download_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Ok(relative_path) = entry.path().strip_prefix(&download_dir) {
                files.push(relative_path.to_string_lossy().to_string());
            }
        }
    }
    files.sort();
    Ok(Json(files))
}

/// # GET /files/*path - Streams a single downloaded file.
pub async fn get_file(State(state): State<AppState>, Path(path): Path<String>) -> Result<impl IntoResponse, AppError> {
    let decoded_path = percent_decode_str(&path).decode_utf8_lossy().to_string();
    let download_dir = download_dir(&state);
    let file_path = download_dir.join(&decoded_path);

    let canonical_base = tokio::fs::canonicalize(&download_dir)
        .await
        .map_err(|_| AppError::NotFound("Download directory does not exist.".to_string()))?;
    let canonical_file = tokio::fs::canonicalize(&file_path)
        .await
        .map_err(|_| AppError::NotFound(format!("File '{}' not found.", decoded_path)))?;

    if !canonical_file.starts_with(&canonical_base) || !canonical_file.is_file() {
        return Err(AppError::NotFound(format!("File '{}' not found.", decoded_path)));
    }

    let file = tokio::fs::File::open(&canonical_file).await?;
    let body = Body::from_stream(tokio_util::io::ReaderStream::new(file));

    let file_name = canonical_file
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', "'"))
        .unwrap_or_default();
    let mut headers = HeaderMap::new();
    let disposition = format!("attachment; filename=\"{}\"", file_name);
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    Ok((headers, body))
}

// ===================================================================
//                          HELPER FUNCTIONS
// ===================================================================

fn download_dir(state: &AppState) -> PathBuf {
    lock_settings(&state.settings)
        .get_str("download_path")
        .map(PathBuf::from)
        .unwrap_or_else(default_download_dir)
}

/// Origins from `[server] allowed_origins` that browsers may call the API from.
///
/// Entries that are not valid header values are skipped, and so is `*`.
pub fn allowed_origins(configured: &[String]) -> Vec<HeaderValue> {
    configured
        .iter()
        .map(|origin| origin.trim().trim_end_matches('/'))
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| {
            if origin == "*" {
                tracing::warn!("Ignoring wildcard CORS origin; list each allowed origin instead");
                return None;
            }
            match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring invalid CORS origin {:?}", origin);
                    None
                }
            }
        })
        .collect()
}

/// CORS for the configured origins. `None` leaves the API same-origin only.
pub fn cors_layer(configured: &[String]) -> Option<CorsLayer> {
    let origins = allowed_origins(configured);
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

/// Recursively overlays `patch` onto `base`. Objects merge key by key; anything else replaces.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}
