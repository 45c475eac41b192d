//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for business logic.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::voice::voice_ws_handler;
use crate::api::ws::{compare_ws_handler, replay_ws_handler, stream_ws_handler};
use crate::api::AppState;
use crate::batch::{BatchOptions, BatchSubmission, FileResult};
use crate::error::{BatchError, ParlanceError, ParlanceResult};
use crate::normalize::NormalizationConfig;
use crate::protocol_constants::SERVICE_ID;
use crate::storage::recent_latency;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/providers", get(list_providers))
        .route("/api/config", get(get_config))
        .route("/api/jobs/transcribe", post(submit_transcribe_job))
        .route("/api/jobs/{id}/status", get(job_status))
        .route("/api/jobs/{id}/results", get(job_results))
        .route("/api/jobs/{id}/summary", get(job_summary))
        .route("/api/history", get(list_history))
        .route("/api/realtime/latency", get(recent_latency_summaries))
        .route("/api/realtime/sessions", get(list_realtime_sessions))
        .route("/api/replay/upload", post(upload_replay_file))
        .route("/ws/stream", get(stream_ws_handler))
        .route("/ws/compare", get(compare_ws_handler))
        .route("/ws/replay", get(replay_ws_handler))
        .route("/ws/voice", get(voice_ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Endpoints
// ─────────────────────────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({
        "service": SERVICE_ID,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = state
        .registry
        .ids()
        .into_iter()
        .filter_map(|id| state.registry.get(&id).ok())
        .map(|provider| {
            json!({
                "id": provider.id(),
                "label": provider.label(),
                "preferredSampleRate": provider.preferred_sample_rate(),
            })
        })
        .collect();
    Json(json!({ "providers": providers }))
}

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    // Expose the tunables clients care about, not the whole object.
    Json(json!({
        "streaming": {
            "targetSampleRate": state.config.streaming.target_sample_rate,
            "chunkMs": state.config.streaming.chunk_ms,
            "keepaliveMs": state.config.streaming.keepalive_ms,
        },
        "jobs": {
            "maxParallel": state.config.jobs.max_parallel,
        },
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch Jobs
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulated multipart fields of a transcribe submission.
#[derive(Default)]
struct TranscribeUpload {
    files: Vec<PathBuf>,
    providers: Vec<String>,
    lang: Option<String>,
    manifest: Option<HashMap<String, String>>,
    options: Option<BatchOptions>,
    normalization: Option<NormalizationConfig>,
}

async fn read_transcribe_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> ParlanceResult<TranscribeUpload> {
    let upload_dir = state.config.jobs.work_dir.join("uploads");
    std::fs::create_dir_all(&upload_dir).map_err(|e| ParlanceError::Storage(e.to_string()))?;

    let mut upload = TranscribeUpload::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                let original = field
                    .file_name()
                    .map(sanitize_file_name)
                    .unwrap_or_else(|| "upload.bin".to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                // Keep the original name: the manifest is keyed by it.
                let dest = upload_dir
                    .join(uuid::Uuid::new_v4().simple().to_string())
                    .join(&original);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ParlanceError::Storage(e.to_string()))?;
                }
                std::fs::write(&dest, &data)
                    .map_err(|e| ParlanceError::Storage(e.to_string()))?;
                upload.files.push(dest);
            }
            "providers" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                upload.providers = text
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
            "provider" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                upload.providers.push(text.trim().to_string());
            }
            "lang" => {
                upload.lang = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?,
                );
            }
            "manifest" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                upload.manifest = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ParlanceError::InvalidRequest(format!("manifest: {e}")))?,
                );
            }
            "options" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                upload.options = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ParlanceError::InvalidRequest(format!("options: {e}")))?,
                );
            }
            "normalization" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
                upload.normalization = Some(
                    serde_json::from_str(&text).map_err(|e| {
                        ParlanceError::InvalidRequest(format!("normalization: {e}"))
                    })?,
                );
            }
            _ => {}
        }
    }
    Ok(upload)
}

fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

async fn submit_transcribe_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ParlanceResult<Json<Value>> {
    let upload = read_transcribe_multipart(&state, multipart).await?;
    if upload.providers.is_empty() {
        return Err(ParlanceError::InvalidRequest(
            "at least one provider is required".to_string(),
        ));
    }

    let job_id = state.runner.submit(BatchSubmission {
        files: upload.files,
        providers: upload.providers,
        lang: upload.lang.unwrap_or_else(|| "en".to_string()),
        manifest: upload.manifest,
        options: upload.options.unwrap_or_default(),
        normalization: upload.normalization.unwrap_or_default(),
        unlink_inputs: true,
    })?;
    Ok(Json(json!({ "jobId": job_id })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ParlanceResult<Json<Value>> {
    let entry = state
        .jobs
        .get(&id)
        .ok_or_else(|| ParlanceError::Batch(BatchError::JobNotFound(id.clone())))?;
    let progress = entry.read().progress();
    Ok(Json(progress))
}

async fn job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ParlanceResult<Json<Value>> {
    // Memory first; evicted jobs stay queryable from storage.
    let results: Vec<FileResult> = match state.jobs.get(&id) {
        Some(entry) => entry.read().results.clone(),
        None => {
            let stored = state.history.results_for(&id);
            if stored.is_empty() {
                return Err(ParlanceError::Batch(BatchError::JobNotFound(id)));
            }
            stored
        }
    };
    Ok(Json(json!({ "results": results })))
}

async fn job_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ParlanceResult<Json<Value>> {
    let results: Vec<FileResult> = match state.jobs.get(&id) {
        Some(entry) => entry.read().results.clone(),
        None => state.history.results_for(&id),
    };
    if results.is_empty() {
        return Err(ParlanceError::Batch(BatchError::JobNotFound(id)));
    }

    let mut by_provider: HashMap<String, Vec<&FileResult>> = HashMap::new();
    for result in &results {
        by_provider
            .entry(result.provider.clone())
            .or_default()
            .push(result);
    }

    let mut summary: Vec<Value> = Vec::new();
    for (provider, rows) in by_provider {
        let count = rows.len() as f64;
        let avg = |extract: &dyn Fn(&FileResult) -> Option<f64>| -> Option<f64> {
            let values: Vec<f64> = rows.iter().filter_map(|r| extract(r)).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        summary.push(json!({
            "provider": provider,
            "fileCount": rows.len(),
            "avgRtf": rows.iter().map(|r| r.rtf).sum::<f64>() / count,
            "avgProcessingMs": rows.iter().map(|r| r.processing_time_ms as f64).sum::<f64>() / count,
            "avgCer": avg(&|r| r.cer),
            "avgWer": avg(&|r| r.wer),
        }));
    }
    Ok(Json(json!({ "jobId": id, "providers": summary })))
}

async fn list_history(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.history.list() }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Realtime
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LatencyQuery {
    #[serde(default = "default_latency_limit")]
    limit: usize,
}

fn default_latency_limit() -> usize {
    50
}

async fn recent_latency_summaries(
    State(state): State<AppState>,
    Query(query): Query<LatencyQuery>,
) -> Json<Value> {
    let summaries = recent_latency(&state.stores.latency, query.limit.min(1000));
    Json(json!({ "summaries": summaries }))
}

async fn list_realtime_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.realtime_log.list_sessions() }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReplayUploadQuery {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    providers: Option<String>,
    #[serde(default)]
    lang: Option<String>,
}

async fn upload_replay_file(
    State(state): State<AppState>,
    Query(query): Query<ReplayUploadQuery>,
    mut multipart: Multipart,
) -> ParlanceResult<Json<Value>> {
    let providers: Vec<String> = query
        .providers
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .or_else(|| query.provider.clone().map(|p| vec![p]))
        .unwrap_or_default();
    if providers.is_empty() {
        return Err(ParlanceError::InvalidRequest(
            "provider is required".to_string(),
        ));
    }
    // Fail fast on unknown providers, before accepting the upload.
    state.registry.resolve_list(&providers)?;

    let upload_dir = state.config.jobs.work_dir.join("replay");
    std::fs::create_dir_all(&upload_dir).map_err(|e| ParlanceError::Storage(e.to_string()))?;

    let mut file_path: Option<PathBuf> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?
    {
        if matches!(field.name(), Some("file") | Some("files")) {
            let data = field
                .bytes()
                .await
                .map_err(|e| ParlanceError::InvalidRequest(e.to_string()))?;
            let dest = upload_dir.join(format!("{}.bin", uuid::Uuid::new_v4().simple()));
            std::fs::write(&dest, &data).map_err(|e| ParlanceError::Storage(e.to_string()))?;
            file_path = Some(dest);
        }
    }
    let file_path = file_path
        .ok_or_else(|| ParlanceError::InvalidRequest("no file uploaded".to_string()))?;

    let session_id = state.replay_sessions.insert(
        providers,
        query.lang.unwrap_or_else(|| "en".to_string()),
        file_path,
    );
    Ok(Json(json!({ "sessionId": session_id })))
}
