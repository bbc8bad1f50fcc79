//! HTTP surface of the curator service.

use super::requests_logging::{log_requests, RequestsLoggingLevel};
use super::schemas;
use super::state::ExpoState;
use crate::collections::{CollectionError, CollectionPatch, StrategyKind};
use crate::filter::Order;
use crate::photo_store::{CollectionRecord, RefreshJobRecord};
use crate::refresh::{RefreshError, RefreshJob, RefreshJobError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info};

pub fn make_expo_router(state: ExpoState, logging_level: RequestsLoggingLevel) -> Router {
    let router = Router::new()
        .route(
            "/collections",
            get(get_collections)
                .put(put_collection)
                .patch(patch_collection)
                .delete(delete_collection),
        )
        .route(
            "/schedules",
            get(get_schedules)
                .put(put_schedule)
                .patch(patch_schedule)
                .delete(delete_schedule),
        )
        .route("/refresh", post(manual_refresh))
        .route("/scan", post(manual_scan))
        .route("/schema/collection.json", get(schema_collection))
        .route("/schema/{class_name}/settings.json", get(schema_settings))
        .route("/schema/schedule.json", get(schema_schedule))
        .route("/default/collection.json", get(default_collection))
        .route("/default/schedule.json", get(default_schedule));

    let router = match &state.frontend_dir {
        Some(dir) => router.fallback_service(
            ServeDir::new(dir).append_index_html_on_directories(true),
        ),
        None => router.route("/", get(|| async { Html("<!doctype html><title>expo</title>") })),
    };

    router
        .layer(middleware::from_fn_with_state(logging_level, log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IdentifierQuery {
    identifier: Option<String>,
    hostname: Option<String>,
}

fn collection_error_response(error: CollectionError) -> Response {
    match error {
        CollectionError::NotFound => (
            StatusCode::NOT_FOUND,
            "No collection for the given identifier",
        )
            .into_response(),
        CollectionError::DuplicateIdentifier(identifier) => (
            StatusCode::BAD_REQUEST,
            format!("Already in use: \"{}\"", identifier),
        )
            .into_response(),
        CollectionError::InvalidIdentifier => {
            (StatusCode::BAD_REQUEST, "Invalid identifier").into_response()
        }
        CollectionError::UnknownClass(class_name) => (
            StatusCode::BAD_REQUEST,
            format!("Unknown collection class: \"{}\"", class_name),
        )
            .into_response(),
        CollectionError::Settings(errors) => {
            (StatusCode::BAD_REQUEST, Json(errors)).into_response()
        }
        CollectionError::Schedule(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        CollectionError::Storage(e) => {
            error!("Collection storage error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn refresh_job_error_response(error: RefreshJobError) -> Response {
    (StatusCode::BAD_REQUEST, error.to_string()).into_response()
}

fn collection_to_json(record: &CollectionRecord) -> JsonValue {
    let settings = StrategyKind::from_class_name(&record.class_name)
        .map(|kind| kind.masked_settings(&record.settings))
        .unwrap_or_else(|| record.settings.clone());
    json!({
        "identifier": record.identifier,
        "display_name": record.display_name,
        "schedule": record.schedule,
        "enabled": record.enabled,
        "class_name": record.class_name,
        "settings": settings,
    })
}

fn refresh_job_to_json(record: &RefreshJobRecord) -> JsonValue {
    json!({
        "identifier": record.identifier,
        "display_name": record.display_name,
        "hostname": record.hostname,
        "schedule": record.schedule,
        "enabled": record.enabled,
        "filter": record.filter,
        "order": record.order,
        "post_command_id": record.post_command_id,
        "affiche_options": record.affiche_options,
    })
}

// =============================================================================
// Collections
// =============================================================================

#[derive(Debug, Deserialize)]
struct CollectionPayload {
    identifier: String,
    #[serde(default)]
    display_name: String,
    schedule: String,
    #[serde(default = "default_true")]
    enabled: bool,
    class_name: String,
    #[serde(default = "empty_object")]
    settings: JsonValue,
}

#[derive(Debug, Deserialize)]
struct CollectionPatchPayload {
    identifier: Option<String>,
    display_name: Option<String>,
    schedule: Option<String>,
    enabled: Option<bool>,
    class_name: Option<String>,
    settings: Option<JsonValue>,
}

fn default_true() -> bool {
    true
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

async fn get_collections(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
) -> Response {
    match query.identifier {
        None => match state.collections.list() {
            Ok(records) => {
                let response: Vec<JsonValue> = records.iter().map(collection_to_json).collect();
                Json(response).into_response()
            }
            Err(e) => collection_error_response(CollectionError::Storage(e)),
        },
        Some(identifier) => match state.collections.get(&identifier) {
            Ok(Some(record)) => Json(collection_to_json(&record)).into_response(),
            Ok(None) => collection_error_response(CollectionError::NotFound),
            Err(e) => collection_error_response(CollectionError::Storage(e)),
        },
    }
}

async fn put_collection(
    State(state): State<ExpoState>,
    Json(payload): Json<CollectionPayload>,
) -> Response {
    let display_name = if payload.display_name.is_empty() {
        payload.identifier.clone()
    } else {
        payload.display_name
    };
    let record = CollectionRecord {
        id: None,
        identifier: payload.identifier,
        display_name,
        schedule: payload.schedule,
        enabled: payload.enabled,
        class_name: payload.class_name,
        settings: payload.settings,
    };

    let collections = state.collections.clone();
    match tokio::task::spawn_blocking(move || collections.add(record)).await {
        Ok(Ok(record)) => {
            info!("Added collection \"{}\"", record.identifier);
            Json(collection_to_json(&record)).into_response()
        }
        Ok(Err(e)) => collection_error_response(e),
        Err(e) => {
            error!("Collection add panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn patch_collection(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
    Json(payload): Json<CollectionPatchPayload>,
) -> Response {
    let Some(identifier) = query.identifier else {
        return (StatusCode::BAD_REQUEST, "Parameter \"identifier\" required").into_response();
    };

    let patch = CollectionPatch {
        identifier: payload.identifier,
        display_name: payload.display_name,
        schedule: payload.schedule,
        enabled: payload.enabled,
        class_name: payload.class_name,
        settings: payload.settings,
    };
    let collections = state.collections.clone();
    match tokio::task::spawn_blocking(move || collections.modify(&identifier, patch)).await {
        Ok(Ok(record)) => {
            info!("Modified collection \"{}\"", record.identifier);
            Json(collection_to_json(&record)).into_response()
        }
        Ok(Err(e)) => collection_error_response(e),
        Err(e) => {
            error!("Collection modify panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn delete_collection(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
) -> Response {
    let Some(identifier) = query.identifier else {
        return (StatusCode::BAD_REQUEST, "Parameter \"identifier\" required").into_response();
    };

    let collections = state.collections.clone();
    let removed_identifier = identifier.clone();
    match tokio::task::spawn_blocking(move || collections.remove(&removed_identifier)).await {
        Ok(Ok(())) => {
            info!("Removed collection \"{}\"", identifier);
            StatusCode::OK.into_response()
        }
        Ok(Err(e)) => collection_error_response(e),
        Err(e) => {
            error!("Collection remove panicked: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// =============================================================================
// Refresh jobs
// =============================================================================

#[derive(Debug, Deserialize)]
struct SchedulePayload {
    identifier: String,
    #[serde(default)]
    display_name: String,
    hostname: String,
    schedule: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_filter")]
    filter: String,
    #[serde(default)]
    order: Order,
    #[serde(default)]
    post_command_id: String,
    #[serde(default = "empty_object")]
    affiche_options: JsonValue,
}

#[derive(Debug, Deserialize)]
struct SchedulePatchPayload {
    identifier: Option<String>,
    display_name: Option<String>,
    hostname: Option<String>,
    schedule: Option<String>,
    enabled: Option<bool>,
    filter: Option<String>,
    order: Option<Order>,
    post_command_id: Option<String>,
    affiche_options: Option<JsonValue>,
}

fn default_filter() -> String {
    "true".to_string()
}

fn validate_post_command_id(state: &ExpoState, post_command_id: &str) -> Result<(), Response> {
    if post_command_id.is_empty() || state.post_commands.contains_key(post_command_id) {
        return Ok(());
    }
    Err(refresh_job_error_response(
        RefreshJobError::UnknownPostCommand(post_command_id.to_string()),
    ))
}

async fn get_schedules(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
) -> Response {
    match query.identifier {
        None => {
            let records = match state.store.list_refresh_jobs() {
                Ok(records) => records,
                Err(e) => {
                    error!("Refresh job storage error: {:#}", e);
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            let response: Vec<JsonValue> = records
                .iter()
                .filter(|record| match &query.hostname {
                    None => true,
                    Some(hostname) => {
                        hostname == &record.hostname
                            || RefreshJob::from_record((*record).clone())
                                .map(|job| hostname == &job.external_hostname())
                                .unwrap_or(false)
                    }
                })
                .map(refresh_job_to_json)
                .collect();
            Json(response).into_response()
        }
        Some(identifier) => match state.store.get_refresh_job(&identifier) {
            Ok(Some(record)) => Json(refresh_job_to_json(&record)).into_response(),
            Ok(None) => (
                StatusCode::NOT_FOUND,
                "No schedule for the given identifier",
            )
                .into_response(),
            Err(e) => {
                error!("Refresh job storage error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

async fn put_schedule(
    State(state): State<ExpoState>,
    Json(payload): Json<SchedulePayload>,
) -> Response {
    if let Err(response) = validate_post_command_id(&state, &payload.post_command_id) {
        return response;
    }

    let display_name = if payload.display_name.is_empty() {
        payload.identifier.clone()
    } else {
        payload.display_name
    };
    let record = RefreshJobRecord {
        id: None,
        identifier: payload.identifier,
        display_name,
        hostname: payload.hostname,
        schedule: payload.schedule,
        enabled: payload.enabled,
        filter: payload.filter,
        order: payload.order.as_str().to_string(),
        affiche_options: payload.affiche_options,
        post_command_id: payload.post_command_id,
    };

    let mut job = match RefreshJob::from_record(record) {
        Ok(job) => job,
        Err(e) => return refresh_job_error_response(e),
    };

    match state.store.get_refresh_job(&job.identifier) {
        Ok(Some(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                "A schedule for the given identifier already exists",
            )
                .into_response()
        }
        Ok(None) => {}
        Err(e) => {
            error!("Refresh job storage error: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let mut record = job.to_record();
    match state.store.upsert_refresh_job(&record) {
        Ok(id) => {
            record.id = Some(id);
            job.id = Some(id);
        }
        Err(e) => {
            error!("Refresh job storage error: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    info!("Added refresh job \"{}\"", record.identifier);
    state.refresh.upsert_job(job).await;
    Json(refresh_job_to_json(&record)).into_response()
}

async fn patch_schedule(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
    Json(payload): Json<SchedulePatchPayload>,
) -> Response {
    let Some(identifier) = query.identifier else {
        return (StatusCode::BAD_REQUEST, "Parameter \"identifier\" required").into_response();
    };

    let stored = match state.store.get_refresh_job(&identifier) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                "No schedule for the given identifier",
            )
                .into_response()
        }
        Err(e) => {
            error!("Refresh job storage error: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let new_identifier = payload.identifier.unwrap_or_else(|| stored.identifier.clone());
    if new_identifier != stored.identifier {
        match state.store.get_refresh_job(&new_identifier) {
            Ok(Some(_)) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("Already in use: \"{}\"", new_identifier),
                )
                    .into_response()
            }
            Ok(None) => {}
            Err(e) => {
                error!("Refresh job storage error: {:#}", e);
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let post_command_id = payload
        .post_command_id
        .unwrap_or_else(|| stored.post_command_id.clone());
    if let Err(response) = validate_post_command_id(&state, &post_command_id) {
        return response;
    }

    let record = RefreshJobRecord {
        id: stored.id,
        identifier: new_identifier,
        display_name: payload.display_name.unwrap_or_else(|| stored.display_name.clone()),
        hostname: payload.hostname.unwrap_or_else(|| stored.hostname.clone()),
        schedule: payload.schedule.unwrap_or_else(|| stored.schedule.clone()),
        enabled: payload.enabled.unwrap_or(stored.enabled),
        filter: payload.filter.unwrap_or_else(|| stored.filter.clone()),
        order: payload
            .order
            .map(|order| order.as_str().to_string())
            .unwrap_or_else(|| stored.order.clone()),
        affiche_options: payload.affiche_options.unwrap_or_else(|| stored.affiche_options.clone()),
        post_command_id,
    };

    let job = match RefreshJob::from_record(record) {
        Ok(job) => job,
        Err(e) => return refresh_job_error_response(e),
    };

    let record = job.to_record();
    if let Err(e) = state.store.upsert_refresh_job(&record) {
        error!("Refresh job storage error: {:#}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if record.identifier != stored.identifier {
        state.refresh.remove_job(&stored.identifier).await;
    }
    state.refresh.upsert_job(job).await;

    info!("Modified refresh job \"{}\"", identifier);
    Json(refresh_job_to_json(&record)).into_response()
}

async fn delete_schedule(
    State(state): State<ExpoState>,
    Query(query): Query<IdentifierQuery>,
) -> Response {
    let Some(identifier) = query.identifier else {
        return (StatusCode::BAD_REQUEST, "Parameter \"identifier\" required").into_response();
    };

    match state.store.delete_refresh_job(&identifier) {
        Ok(true) => {
            state.refresh.remove_job(&identifier).await;
            info!("Removed refresh job \"{}\"", identifier);
            StatusCode::OK.into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            "No schedule for the given identifier",
        )
            .into_response(),
        Err(e) => {
            error!("Refresh job storage error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// =============================================================================
// Manual triggers
// =============================================================================

#[derive(Debug, Deserialize)]
struct TriggerPayload {
    identifier: String,
    #[serde(default)]
    delay: f64,
}

async fn manual_refresh(
    State(state): State<ExpoState>,
    Json(payload): Json<TriggerPayload>,
) -> Response {
    let delay = Duration::from_secs_f64(payload.delay.max(0.0));
    match state.refresh.manual_refresh(&payload.identifier, delay).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(RefreshError::NotFound) => (
            StatusCode::NOT_FOUND,
            "No enabled schedule for the given identifier",
        )
            .into_response(),
        Err(RefreshError::SchedulerStopped) => {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn manual_scan(
    State(state): State<ExpoState>,
    Json(payload): Json<TriggerPayload>,
) -> Response {
    let delay = Duration::from_secs_f64(payload.delay.max(0.0));
    match state.collections.manual_scan(&payload.identifier, delay) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(CollectionError::NotFound) => (
            StatusCode::NOT_FOUND,
            "No enabled collection for the given identifier",
        )
            .into_response(),
        Err(e) => collection_error_response(e),
    }
}

// =============================================================================
// Schemas and defaults
// =============================================================================

async fn schema_collection() -> Json<JsonValue> {
    Json(schemas::collection_schema())
}

async fn schema_settings(Path(class_name): Path<String>) -> Response {
    match StrategyKind::from_class_name(&class_name) {
        Some(kind) => Json(kind.settings_schema()).into_response(),
        None => (StatusCode::BAD_REQUEST, "Unknown collection class").into_response(),
    }
}

async fn schema_schedule(State(state): State<ExpoState>) -> Json<JsonValue> {
    Json(schemas::schedule_schema(&state.post_commands))
}

async fn default_collection() -> Json<JsonValue> {
    Json(schemas::default_collection())
}

async fn default_schedule() -> Json<JsonValue> {
    Json(schemas::default_schedule())
}
