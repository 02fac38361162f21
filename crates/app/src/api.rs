//! Listener management endpoints.
//!
//! Everything scoped to one listener requires its key in `x-api-key`. The
//! existence check runs first, so a deleted listener reads as 404.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use hooksink_core::types::{CapturedRequest, Listener};
use hooksink_storage::ListenerWithCount;

use crate::problem::ProblemResponse;
use crate::registry::ListenerRegistry;
use crate::router::AppState;

const API_KEY_HEADER: &str = "x-api-key";
const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 100;
const MAX_BULK_DELETE: u64 = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerView {
    id: String,
    name: Option<String>,
    api_key: String,
    webhook_url: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_count: Option<u64>,
}

impl ListenerView {
    fn from_counted(state: &AppState, entry: ListenerWithCount) -> Self {
        let mut view = Self::from_listener(state, entry.listener);
        view.request_count = Some(entry.request_count);
        view
    }

    fn from_listener(state: &AppState, listener: Listener) -> Self {
        Self {
            webhook_url: state.webhook_url(&listener.id),
            id: listener.id,
            name: listener.name,
            api_key: listener.api_key,
            created_at: listener.created_at,
            request_count: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListenerList {
    listeners: Vec<ListenerView>,
}

#[derive(Debug, Default, Deserialize)]
struct CreateListenerBody {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPage {
    requests: Vec<CapturedRequest>,
    total: u64,
    has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<u64>,
}

/// Raw query values; unparsable numbers fall back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|value| value.clamp(1, i64::from(MAX_PAGE_LIMIT)) as u32)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    fn offset(&self) -> u64 {
        self.offset
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|value| value.max(0) as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BulkDeleteQuery {
    count: Option<String>,
}

impl BulkDeleteQuery {
    fn count(&self) -> Result<u64, ProblemResponse> {
        self.count
            .as_deref()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| (1..=MAX_BULK_DELETE).contains(value))
            .ok_or_else(|| {
                ProblemResponse::new(
                    StatusCode::BAD_REQUEST,
                    "invalid_count",
                    format!("count must be between 1 and {MAX_BULK_DELETE}"),
                )
            })
    }
}

fn storage_failure(context: &'static str, err: impl std::fmt::Display) -> ProblemResponse {
    error!(stage = "api", error = %err, "{context}");
    ProblemResponse::internal(context)
}

/// Loads the listener and checks the presented key.
async fn authorized_listener(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
) -> Result<ListenerWithCount, ProblemResponse> {
    let entry = state
        .registry()
        .get(id)
        .await
        .map_err(|err| storage_failure("failed to load listener", err))?
        .ok_or_else(ProblemResponse::listener_not_found)?;

    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !ListenerRegistry::authorize(&entry.listener, presented) {
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "missing or invalid x-api-key header",
        ));
    }
    Ok(entry)
}

pub async fn create_listener(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        CreateListenerBody::default()
    } else {
        serde_json::from_slice::<CreateListenerBody>(&body).map_err(|err| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "invalid_body",
                format!("invalid listener payload: {err}"),
            )
        })?
    };

    let listener = state
        .registry()
        .create(payload.name)
        .await
        .map_err(|err| storage_failure("failed to create listener", err))?;

    let view = ListenerView::from_listener(&state, listener);
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

pub async fn list_listeners(
    State(state): State<AppState>,
) -> Result<Json<ListenerList>, ProblemResponse> {
    let listeners = state
        .registry()
        .list()
        .await
        .map_err(|err| storage_failure("failed to list listeners", err))?
        .into_iter()
        .map(|entry| ListenerView::from_counted(&state, entry))
        .collect();
    Ok(Json(ListenerList { listeners }))
}

pub async fn get_listener(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ListenerView>, ProblemResponse> {
    let entry = authorized_listener(&state, &id, &headers).await?;
    Ok(Json(ListenerView::from_counted(&state, entry)))
}

pub async fn delete_listener(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Deleted>, ProblemResponse> {
    authorized_listener(&state, &id, &headers).await?;
    let deleted = state
        .registry()
        .delete(&id)
        .await
        .map_err(|err| storage_failure("failed to delete listener", err))?;
    if !deleted {
        return Err(ProblemResponse::listener_not_found());
    }
    Ok(Json(Deleted {
        success: true,
        deleted: None,
    }))
}

pub async fn list_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
    headers: HeaderMap,
) -> Result<Json<RequestPage>, ProblemResponse> {
    authorized_listener(&state, &id, &headers).await?;
    let limit = query.limit();
    let offset = query.offset();

    let repo = state.storage().requests();
    let requests = repo
        .list_for_listener(&id, limit, offset)
        .await
        .map_err(|err| storage_failure("failed to list requests", err))?;
    let total = repo
        .count_for_listener(&id)
        .await
        .map_err(|err| storage_failure("failed to count requests", err))?;

    Ok(Json(RequestPage {
        requests,
        total,
        has_more: offset.saturating_add(u64::from(limit)) < total,
    }))
}

pub async fn delete_oldest_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BulkDeleteQuery>,
    headers: HeaderMap,
) -> Result<Json<Deleted>, ProblemResponse> {
    authorized_listener(&state, &id, &headers).await?;
    let count = query.count()?;

    let deleted = state
        .storage()
        .requests()
        .delete_oldest(&id, count)
        .await
        .map_err(|err| storage_failure("failed to delete requests", err))?;
    info!(stage = "api", listener_id = %id, requested = count, deleted, "oldest requests deleted");

    Ok(Json(Deleted {
        success: true,
        deleted: Some(deleted),
    }))
}

pub async fn delete_request(
    State(state): State<AppState>,
    Path((id, request_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Deleted>, ProblemResponse> {
    authorized_listener(&state, &id, &headers).await?;

    let deleted = state
        .storage()
        .requests()
        .delete_one(&id, &request_id)
        .await
        .map_err(|err| storage_failure("failed to delete request", err))?;
    if !deleted {
        return Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "request_not_found",
            "request not found",
        ));
    }

    Ok(Json(Deleted {
        success: true,
        deleted: None,
    }))
}
