use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use playback_core::{
    Control, FaultKind, FaultRecord, HeadlessSurface, PlaybackSession, Player, PlayerConfig,
    PlayerHandle, SessionSnapshot, SignedUrlDirectory, SourceInfo, SourceKind, StreamSource,
    TierMenu, TierSelection, Transport,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Where a session's stream comes from: a URL with optional signed URLs,
/// or a recording looked up through the recording service.
#[derive(Debug, Default, Deserialize)]
pub struct SourceRequest {
    pub url: Option<String>,
    pub recording_id: Option<String>,
    pub signed_urls: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(flatten)]
    pub source: SourceRequest,
    pub target_height: Option<u32>,
    pub abr: Option<bool>,
    pub max_segments: Option<u64>,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub state: &'static str,
    pub source: SourceInfo,
}

#[derive(Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: &'static str,
    pub source_kind: SourceKind,
    pub active_tier: Option<String>,
    pub fragments_loaded: u64,
    pub fault_count: u64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: TierSelection,
    pub generation: Option<u64>,
}

#[derive(Serialize)]
pub struct FaultsResponse {
    pub session_id: String,
    pub fault_counts: BTreeMap<FaultKind, u64>,
    pub faults: Vec<FaultRecord>,
}

#[derive(Serialize)]
pub struct DeleteSessionResponse {
    pub message: String,
    pub id: String,
}

#[derive(Serialize)]
pub struct DeleteAllResponse {
    pub message: String,
    pub deleted_count: usize,
    pub deleted_ids: Vec<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/sessions",
            post(create_session).get(list_sessions).delete(delete_all_sessions),
        )
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/tiers", get(get_tiers))
        .route("/sessions/{id}/tier", put(request_tier))
        .route("/sessions/{id}/controls", post(control))
        .route("/sessions/{id}/source", put(change_source))
        .route("/sessions/{id}/faults", get(get_faults))
}

fn is_valid_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| u.scheme() == "http" || u.scheme() == "https")
        .unwrap_or(false)
}

fn parse_session_id(id: &str) -> Result<String, ApiError> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|_| ApiError::BadRequest(format!("Invalid session ID: {}", id)))
}

fn get_handle(state: &AppState, id: &str) -> Result<PlayerHandle, ApiError> {
    let id = parse_session_id(id)?;
    state
        .sessions
        .get(&id)
        .map(|r| r.value().clone())
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))
}

async fn resolve_source(
    state: &AppState,
    request: SourceRequest,
) -> Result<StreamSource, ApiError> {
    match (request.url, request.recording_id) {
        (Some(url), None) => {
            if !is_valid_url(&url) {
                return Err(ApiError::BadRequest(format!("Invalid URL: {}", url)));
            }
            let directory = request
                .signed_urls
                .map(SignedUrlDirectory::from_entries)
                .transpose()?;
            StreamSource::from_url(&url, directory).map_err(|e| ApiError::BadRequest(e.to_string()))
        }
        (None, Some(recording_id)) => {
            if recording_id.trim().is_empty() {
                return Err(ApiError::BadRequest("recording_id must not be empty".into()));
            }
            if request.signed_urls.is_some() {
                return Err(ApiError::BadRequest(
                    "signed_urls come from the recording service when recording_id is used".into(),
                ));
            }
            let backend = state.backend.as_ref().ok_or_else(|| {
                ApiError::BadRequest("No recording service configured".into())
            })?;
            backend.resolve(&recording_id).await.map_err(|e| {
                warn!(recording_id, error = %e, "Could not resolve recording");
                ApiError::from(e)
            })
        }
        (Some(_), Some(_)) => Err(ApiError::BadRequest(
            "Provide either url or recording_id, not both".into(),
        )),
        (None, None) => Err(ApiError::BadRequest("url or recording_id is required".into())),
    }
}

fn open_player(state: &AppState, source: StreamSource, config: PlayerConfig) -> PlayerHandle {
    let factory = Arc::clone(&state.factory);
    let session = PlaybackSession::start(
        source,
        config,
        Box::new(HeadlessSurface::new()),
        Arc::clone(&state.fetch),
        |loader, config| factory(loader, config),
    )
    .with_notifier(state.notification_tx.clone());

    let (handle, _task) = Player::spawn(
        session,
        Arc::clone(&state.fetch),
        Arc::clone(&state.factory),
    );
    handle
}

/// POST /api/v1/sessions
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut config = state.default_config.clone();
    if let Some(height) = body.target_height {
        if height == 0 {
            return Err(ApiError::BadRequest("target_height must be greater than 0".into()));
        }
        config = config.with_target_height(height);
    }
    if let Some(abr) = body.abr {
        config = config.with_abr(abr);
    }
    if body.max_segments.is_some() {
        config = config.with_max_segments(body.max_segments);
    }

    let source = resolve_source(&state, body.source).await?;
    let handle = open_player(&state, source, config);
    let snapshot = handle.snapshot();
    state.sessions.insert(snapshot.id.clone(), handle);

    info!(session_id = %snapshot.id, kind = ?snapshot.source.kind, "Session created");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            id: snapshot.id,
            state: snapshot.state.name(),
            source: snapshot.source,
        }),
    ))
}

/// GET /api/v1/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    let mut snapshots: Vec<SessionSnapshot> =
        state.sessions.iter().map(|e| e.value().snapshot()).collect();
    snapshots.sort_by_key(|s| s.created_at);

    Json(
        snapshots
            .into_iter()
            .map(|s| SessionSummary {
                state: s.state.name(),
                source_kind: s.source.kind,
                active_tier: s.active_tier.map(|t| t.name),
                fragments_loaded: s.fragments_loaded,
                fault_count: s.fault_counts.values().sum(),
                created_at: s.created_at.to_rfc3339(),
                id: s.id,
            })
            .collect(),
    )
}

/// GET /api/v1/sessions/:id
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(get_handle(&state, &id)?.snapshot()))
}

/// DELETE /api/v1/sessions/:id
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteSessionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let (_, handle) = state
        .sessions
        .remove(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))?;

    if handle.stop().await.is_err() {
        warn!(session_id = %id, "Player had already stopped");
    }

    Ok(Json(DeleteSessionResponse {
        message: "Session stopped and deleted".into(),
        id,
    }))
}

/// DELETE /api/v1/sessions
async fn delete_all_sessions(State(state): State<AppState>) -> Json<DeleteAllResponse> {
    let entries: Vec<(String, PlayerHandle)> = state
        .sessions
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();

    join_all(entries.iter().map(|(_, handle)| handle.stop())).await;

    let ids: Vec<String> = entries
        .into_iter()
        .filter_map(|(id, _)| state.sessions.remove(&id).map(|(id, _)| id))
        .collect();

    Json(DeleteAllResponse {
        message: "All sessions stopped and deleted".into(),
        deleted_count: ids.len(),
        deleted_ids: ids,
    })
}

/// GET /api/v1/sessions/:id/tiers
async fn get_tiers(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TierMenu>, ApiError> {
    let snapshot = get_handle(&state, &id)?.snapshot();
    match (snapshot.tiers, snapshot.source.kind) {
        (Some(menu), _) => Ok(Json(menu)),
        (None, SourceKind::Progressive) => Err(ApiError::Conflict(
            "Progressive source has no quality tiers".into(),
        )),
        (None, SourceKind::Adaptive) => Err(ApiError::Conflict(format!(
            "Session {} is {}",
            snapshot.id,
            snapshot.state.name()
        ))),
    }
}

/// PUT /api/v1/sessions/:id/tier
async fn request_tier(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TierRequest>,
) -> Result<Json<TierMenu>, ApiError> {
    let handle = get_handle(&state, &id)?;
    let menu = handle.request_tier(body.tier, body.generation).await?;
    Ok(Json(menu))
}

/// POST /api/v1/sessions/:id/controls
async fn control(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Control>,
) -> Result<Json<Transport>, ApiError> {
    let handle = get_handle(&state, &id)?;
    Ok(Json(handle.control(body).await?))
}

/// PUT /api/v1/sessions/:id/source
async fn change_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SourceRequest>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let handle = get_handle(&state, &id)?;
    let source = resolve_source(&state, body).await?;
    Ok(Json(handle.change_source(source).await?))
}

/// GET /api/v1/sessions/:id/faults
async fn get_faults(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FaultsResponse>, ApiError> {
    let snapshot = get_handle(&state, &id)?.snapshot();
    Ok(Json(FaultsResponse {
        session_id: snapshot.id,
        fault_counts: snapshot.fault_counts,
        faults: snapshot.recent_faults,
    }))
}
