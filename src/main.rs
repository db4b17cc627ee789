mod config;
mod error;
mod models;
mod services;
mod utils;

use anyhow::Context;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{Html, Json},
    routing::{get, post},
};
use config::Config;
use error::MergeError;
use models::{JobRecord, MotionParams, RunState};
use serde_json::{Value, json};
use services::pipeline::{BookClaim, Pipeline, ProgressEvent, ProgressSink};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, fmt};

const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

type Jobs = Arc<RwLock<HashMap<String, JobRecord>>>;
type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    jobs: Jobs,
    input_dir: PathBuf,
    job_ttl: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("moviefy=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let pipeline = Arc::new(Pipeline::from_config(&config));
    let app_state = AppState {
        pipeline,
        jobs: Arc::new(RwLock::new(HashMap::new())),
        input_dir: config.input_dir.clone(),
        job_ttl: config.job_ttl,
    };

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app(app_state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    let media = ServeDir::new(state.pipeline.output_root());

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/upload", post(upload_book))
        .route("/jobs/:id", get(job_status))
        .route("/books/:book/remerge", post(remerge_book))
        .nest_service("/media", media)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::AllowMethods::any())
                .allow_headers(tower_http::cors::AllowHeaders::any()),
        )
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_check() -> &'static str {
    "OK"
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
}

/// Public URL of a book's merged video under the `/media` mount.
fn media_url(book: &str) -> String {
    format!("/media/{}/Merged_videos/{}_final_video.mp4", book, book)
}

async fn upload_book(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut cfg_scale = MotionParams::DEFAULT_CFG_SCALE;
    let mut motion_bucket_id = MotionParams::DEFAULT_MOTION_BUCKET_ID;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or("unknown").to_string();
        match name.as_str() {
            "epub_file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
                upload = Some((file_name, data.to_vec()));
            }
            "cfg_scale" | "motion_bucket_id" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
                let invalid =
                    || api_error(StatusCode::BAD_REQUEST, format!("invalid {}: {:?}", name, raw));
                if name == "cfg_scale" {
                    cfg_scale = raw.trim().parse().map_err(|_| invalid())?;
                } else {
                    motion_bucket_id = raw.trim().parse().map_err(|_| invalid())?;
                }
            }
            _ => tracing::debug!("Ignoring form field {}", name),
        }
    }

    let (file_name, data) =
        upload.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing epub_file field"))?;
    if !file_name.to_ascii_lowercase().ends_with(".epub") {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "please upload an .epub file",
        ));
    }
    if data.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "uploaded file is empty"));
    }
    let params = MotionParams::new(cfg_scale, motion_bucket_id)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;

    let book = utils::book_stem(&file_name);
    let claim = state
        .pipeline
        .claim(&book)
        .map_err(|e| api_error(StatusCode::CONFLICT, e.to_string()))?;
    let epub_path = state.input_dir.join(format!("{}.epub", book));
    save_upload(&epub_path, &data).await.map_err(|e| {
        tracing::error!("Failed to store upload {}: {:#}", epub_path.display(), e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload")
    })?;

    let job_id = uuid::Uuid::new_v4().to_string();
    {
        let mut jobs = state.jobs.write().unwrap_or_else(PoisonError::into_inner);
        prune_expired(&mut jobs, tokio::time::Instant::now(), state.job_ttl);
        jobs.insert(job_id.clone(), JobRecord::new(&job_id, &book));
    }
    tracing::info!(
        job_id = %job_id,
        cfg_scale = params.cfg_scale(),
        motion_bucket_id = params.motion_bucket_id(),
        "Queued {} ({} bytes)",
        book,
        data.len()
    );

    tokio::spawn(run_job(state.clone(), job_id.clone(), epub_path, claim, params));

    Ok(Json(json!({
        "success": true,
        "job_id": job_id,
        "status_url": format!("/jobs/{}", job_id),
    })))
}

async fn save_upload(path: &std::path::Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}

async fn run_job(
    state: AppState,
    job_id: String,
    epub_path: PathBuf,
    claim: BookClaim,
    params: MotionParams,
) {
    let book = claim.book().to_string();
    let sink = JobSink {
        job_id,
        jobs: state.jobs.clone(),
    };
    sink.update(|record| record.state = RunState::Extracting);

    let outcome = state
        .pipeline
        .run_book(&claim, &epub_path, params, &sink)
        .await;

    sink.update(|record| match outcome {
        Ok(report) => {
            record.chapters_total = report.chapters.len();
            if let Some(e) = &report.merge_error {
                record.messages.push(format!("Merge failed: {}", e));
            }
            record.video_url = report.merged_video.as_ref().map(|_| media_url(&book));
            record.finish(if record.video_url.is_some() {
                RunState::Done
            } else {
                RunState::Failed
            });
            record.chapters = report.chapters;
        }
        Err(e) => {
            tracing::error!("Book {} failed: {:#}", book, e);
            record.messages.push(format!("{:#}", e));
            record.finish(RunState::Failed);
        }
    });
}

/// Drop finished jobs older than `ttl`.
fn prune_expired(jobs: &mut HashMap<String, JobRecord>, now: tokio::time::Instant, ttl: Duration) {
    let before = jobs.len();
    jobs.retain(|_, record| !record.expired(now, ttl));
    if jobs.len() < before {
        tracing::debug!("Evicted {} expired jobs", before - jobs.len());
    }
}

/// Mirrors pipeline progress into the job registry.
struct JobSink {
    job_id: String,
    jobs: Jobs,
}

impl JobSink {
    fn update(&self, f: impl FnOnce(&mut JobRecord)) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = jobs.get_mut(&self.job_id) {
            f(record);
        }
    }
}

impl ProgressSink for JobSink {
    fn emit(&self, event: ProgressEvent) {
        self.update(|record| match event {
            ProgressEvent::Extracted { chapters } => {
                record.chapters_total = chapters;
                record.state = RunState::Rendering;
                record.messages.push(format!("Found {} chapters", chapters));
            }
            ProgressEvent::ChapterSummarized { index, summary } => {
                record.messages.push(format!("Chapter {} summarized: {}", index, summary));
            }
            ProgressEvent::ChapterRendered { index, .. } => {
                record.messages.push(format!("Chapter {} video ready", index));
            }
            ProgressEvent::ChapterFailed { index, error } => {
                record.messages.push(format!("Chapter {} failed: {}", index, error));
            }
            ProgressEvent::Merging { clips } => {
                record.state = RunState::Merging;
                record.messages.push(format!("Merging {} clips", clips));
            }
            ProgressEvent::Merged { .. } => {
                record.messages.push("Merged video ready".to_string());
            }
            ProgressEvent::MergeFailed { .. } => {}
        });
    }
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let jobs = state.jobs.read().unwrap_or_else(PoisonError::into_inner);
    jobs.get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("unknown job {}", id)))
}

async fn remerge_book(
    State(state): State<AppState>,
    Path(book): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let book = utils::book_stem(&book);
    let claim = state
        .pipeline
        .claim(&book)
        .map_err(|e| api_error(StatusCode::CONFLICT, e.to_string()))?;
    if !tokio::fs::try_exists(&claim.layout().videos)
        .await
        .unwrap_or(false)
    {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no clips found for {}", book),
        ));
    }

    match state.pipeline.remerge(&claim).await {
        Ok(path) => {
            tracing::info!("Re-merged {} into {}", book, path.display());
            Ok(Json(json!({ "success": true, "video_url": media_url(&book) })))
        }
        Err(MergeError::Empty) => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("no clips found for {}", book),
        )),
        Err(e) => {
            tracing::error!("Re-merging {} failed: {}", book, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Moviefy</title>
    <meta charset="utf-8">
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; max-width: 800px; }
        .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
        label { display: block; margin-top: 12px; }
        #log { background-color: #f5f5f5; padding: 10px; border-radius: 4px; font-family: monospace; white-space: pre-wrap; }
        video { width: 100%; margin-top: 20px; }
    </style>
</head>
<body>
    <h1>Moviefy</h1>

    <div class="info-box">
        <p>Upload an EPUB book. Every chapter is summarized, illustrated and
        animated, then the clips are joined into one video.</p>
    </div>

    <form id="upload" enctype="multipart/form-data">
        <label>Book <input type="file" name="epub_file" accept=".epub" required></label>
        <label>cfg_scale <span id="cfg_value">5</span>
            <input type="range" name="cfg_scale" min="1" max="10" step="0.1" value="5"
                   oninput="cfg_value.textContent = this.value"></label>
        <label>motion_bucket_id <span id="motion_value">50</span>
            <input type="range" name="motion_bucket_id" min="1" max="255" step="1" value="50"
                   oninput="motion_value.textContent = this.value"></label>
        <p><button type="submit">Make movie</button></p>
    </form>

    <h2>Status: <span id="state">idle</span></h2>
    <div id="log"></div>
    <div id="player"></div>

    <script>
        const form = document.getElementById('upload');
        const stateEl = document.getElementById('state');
        const logEl = document.getElementById('log');
        const playerEl = document.getElementById('player');

        async function poll(url) {
            const res = await fetch(url);
            if (!res.ok) { stateEl.textContent = 'unknown job'; return; }
            const job = await res.json();
            stateEl.textContent = job.state;
            logEl.textContent = job.messages.join('\n');
            if (job.state === 'done' && job.video_url) {
                playerEl.innerHTML = '<video controls src="' + job.video_url + '"></video>';
            } else if (job.state !== 'failed') {
                setTimeout(() => poll(url), 5000);
            }
        }

        form.addEventListener('submit', async (event) => {
            event.preventDefault();
            playerEl.innerHTML = '';
            logEl.textContent = '';
            stateEl.textContent = 'uploading';
            const res = await fetch('/upload', { method: 'POST', body: new FormData(form) });
            const body = await res.json();
            if (!body.success) { stateEl.textContent = 'rejected: ' + body.error; return; }
            poll(body.status_url);
        });
    </script>
</body>
</html>
"#;
