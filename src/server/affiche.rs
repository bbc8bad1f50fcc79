//! HTTP surface of the display agent service.

use super::requests_logging::{log_requests, RequestsLoggingLevel};
use super::state::{AfficheState, GuardedDisplayEngine};
use crate::display::{file_name_from_url, random_job_id, sanitize_file_name, with_job_suffix};
use crate::refresh::{local_file_path, machine_hostname};
use axum::{
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::sse::{Event, Sse},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Json, Router,
};
use futures::stream::Stream;
use serde_json::{json, Value as JsonValue};
use std::convert::Infallible;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{debug, error, info};

/// Keep-alive bound for the SSE stream: a snapshot is re-emitted at least
/// this often even without a state change.
const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(120);

pub fn make_affiche_router(state: AfficheState, logging_level: RequestsLoggingLevel) -> Router {
    let router = Router::new()
        .route("/", get(root).post(upload))
        .route("/status", get(status))
        .route("/status/stream", get(status_stream))
        .route("/preview/{file_name}", get(preview))
        .route(
            "/display_writer_options_schema.json",
            get(options_schema),
        )
        .route(
            "/display_writer_options_defaults.json",
            get(options_defaults),
        )
        .route("/expo", get(expo_proxy));

    let router = match &state.frontend_dir {
        Some(dir) => router.fallback_service(
            ServeDir::new(dir).append_index_html_on_directories(true),
        ),
        None => router,
    };

    router
        .layer(middleware::from_fn_with_state(logging_level, log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root(State(state): State<AfficheState>) -> Response {
    match &state.frontend_dir {
        // With a frontend directory the fallback ServeDir handles assets; the
        // root still serves its index.
        Some(dir) => match tokio::fs::read_to_string(dir.join("index.html")).await {
            Ok(index) => Html(index).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        },
        None => Html("<!doctype html><title>affiche</title>").into_response(),
    }
}

// =============================================================================
// Upload
// =============================================================================

/// A 302 back to the upload page: used both for the single-slot busy
/// conflict (the client polls /status until the slot frees up) and for empty
/// submissions.
fn redirect_to_root() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/")]).into_response()
}

struct UploadFields {
    file: Option<(String, Vec<u8>)>,
    fields: Vec<(String, String)>,
}

async fn read_upload_fields(state: &AfficheState, request: Request) -> Result<UploadFields, Response> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut file = None;
    let mut fields = Vec::new();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    return Err((StatusCode::BAD_REQUEST, e.to_string()).into_response())
                }
            };
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            if name == "file" {
                let file_name = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
                file = Some((file_name, data.to_vec()));
            } else if let Ok(text) = field.text().await {
                fields.push((name, text));
            }
        }
    } else {
        let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, state)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
        fields = pairs;
    }

    Ok(UploadFields { file, fields })
}

async fn download_url(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<(String, Vec<u8>)> {
    // A curator on the same host hands over file URLs; those are read
    // directly instead of fetched.
    if let Some(path) = url.starts_with("file://").then(|| local_file_path(url)).flatten() {
        let file_name = path
            .file_name()
            .map(|name| sanitize_file_name(&name.to_string_lossy()))
            .unwrap_or_else(|| "url_image".to_string());
        let bytes = tokio::fs::read(&path).await?;
        return Ok((file_name, bytes));
    }

    let response = client.get(url).send().await?.error_for_status()?;
    let content_disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let file_name = file_name_from_url(url, content_disposition.as_deref(), "url_image");
    let bytes = response.bytes().await?;
    Ok((file_name, bytes.to_vec()))
}

async fn upload(State(state): State<AfficheState>, request: Request) -> Response {
    // A busy engine refuses the submission outright; the client polls
    // /status until the slot frees up.
    if state.engine.is_busy() {
        return redirect_to_root();
    }

    let UploadFields { file, fields } = match read_upload_fields(&state, request).await {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    let url = fields
        .iter()
        .find(|(name, _)| name == "url")
        .map(|(_, value)| value.clone());
    if file.is_none() && url.is_none() {
        return redirect_to_root();
    }

    let job_id = random_job_id();
    let (file_name, bytes) = match file {
        Some((name, bytes)) => (with_job_suffix(&sanitize_file_name(&name), &job_id), bytes),
        None => {
            let url = url.expect("checked above");
            match download_url(&state.http, &url).await {
                Ok((name, bytes)) => (with_job_suffix(&name, &job_id), bytes),
                Err(e) => {
                    debug!("Failed to download image from \"{}\": {:#}", url, e);
                    return (
                        StatusCode::BAD_REQUEST,
                        "Failed to retrieve the file from the URL",
                    )
                        .into_response();
                }
            }
        }
    };

    info!("Received image {}", file_name);
    let file_path = state.engine.upload_dir().join(&file_name);
    if let Err(e) = tokio::fs::write(&file_path, &bytes).await {
        error!("Failed to store upload {:?}: {}", file_path, e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut options = serde_json::Map::new();
    for (name, value) in &fields {
        if matches!(name.as_str(), "file" | "url" | "info") {
            continue;
        }
        if let Some(coerced) = state.config.coerce_option_value(name, value) {
            options.insert(name.clone(), coerced);
        }
    }
    let info = fields
        .iter()
        .find(|(name, _)| name == "info")
        .and_then(|(_, value)| serde_json::from_str::<JsonValue>(value).ok())
        .unwrap_or_else(|| json!({}));

    if !state
        .engine
        .try_start(&job_id, file_path.clone(), JsonValue::Object(options), info)
    {
        // Lost the race against another upload.
        let _ = tokio::fs::remove_file(&file_path).await;
    }
    redirect_to_root()
}

// =============================================================================
// Status
// =============================================================================

async fn status(State(engine): State<GuardedDisplayEngine>) -> Json<JsonValue> {
    Json(engine.snapshot().to_client_json())
}

async fn status_stream(
    State(engine): State<GuardedDisplayEngine>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = engine.subscribe();
    let stream = futures::stream::unfold((receiver, true), |(mut receiver, first)| async move {
        if !first {
            match tokio::time::timeout(STREAM_KEEP_ALIVE, receiver.changed()).await {
                // State changed: fall through and emit the new snapshot.
                Ok(Ok(())) => {}
                // Engine gone: end the stream.
                Ok(Err(_)) => return None,
                // Timed out: re-emit the current snapshot as a keep-alive.
                Err(_) => {}
            }
        }
        let snapshot = receiver.borrow_and_update().clone();
        let payload = serde_json::to_string(&snapshot.to_client_json())
            .unwrap_or_else(|_| "{}".to_string());
        Some((Ok(Event::default().data(payload)), (receiver, false)))
    });
    Sse::new(stream)
}

async fn preview(
    State(engine): State<GuardedDisplayEngine>,
    Path(file_name): Path<String>,
) -> Response {
    let current = engine.snapshot().preview;
    if current.as_deref() != Some(file_name.as_str()) {
        return StatusCode::NO_CONTENT.into_response();
    }

    match tokio::fs::read(engine.preview_dir().join(&file_name)).await {
        Ok(bytes) => {
            let mime = infer::get(&bytes)
                .map(|kind| kind.mime_type())
                .unwrap_or("application/octet-stream");
            ([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response()
        }
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

// =============================================================================
// Configuration surface
// =============================================================================

async fn options_schema(State(state): State<AfficheState>) -> Response {
    if let Some(path) = &state.config.options_schema_path {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => match serde_json::from_str::<JsonValue>(&text) {
                Ok(schema) => return Json(schema).into_response(),
                Err(e) => {
                    error!("Invalid options schema file {:?}: {}", path, e);
                }
            },
            Err(e) => {
                error!("Can't read options schema file {:?}: {}", path, e);
            }
        }
    }
    Json(state.config.options_schema()).into_response()
}

async fn options_defaults(State(state): State<AfficheState>) -> Json<JsonValue> {
    Json(state.config.options_defaults())
}

/// Look up this panel's schedules on the configured curator.
async fn expo_proxy(State(state): State<AfficheState>) -> Response {
    let Some(address) = &state.config.expo_address else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let own_hostname = format!("{}:{}", machine_hostname(), state.port);
    let result = state
        .http
        .get(format!("http://{}/schedules", address))
        .query(&[("hostname", own_hostname)])
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match result {
        Ok(response) => match response.json::<JsonValue>().await {
            Ok(body) => Json(body).into_response(),
            Err(e) => {
                error!("Curator returned an invalid response: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Curator is unavailable").into_response()
            }
        },
        Err(e) => {
            error!("Curator lookup failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "Curator is unavailable").into_response()
        }
    }
}
