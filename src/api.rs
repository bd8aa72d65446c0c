//! REST endpoints for ingestion and change-event review.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::changes::model::{ChangeEventEdit, ChangeEventQuery, ChangeEventStatus};
use crate::changes::workflow::{ManualChangeDraft, Workflow};
use crate::error::{IngestError, WorkflowError};
use crate::ingest::model::NewIngestEvent;
use crate::ingest::service::IngestService;

/// Header carrying the calling contractor's id.
pub const CONTRACTOR_HEADER: &str = "x-contractor-id";
const DEFAULT_PAGE_SIZE: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub workflow: Workflow,
}

/// Build the Axum router with all REST routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ingest", post(submit_ingest))
        .route("/api/ingest/{id}", get(get_ingest))
        .route("/api/projects/{id}/change-events", get(list_change_events))
        .route(
            "/api/projects/{id}/change-events/manual",
            post(create_manual_change_event),
        )
        .route("/api/change-events/{id}", put(edit_change_event))
        .route("/api/change-events/{id}/confirm", post(confirm_change_event))
        .route("/api/change-events/{id}/reject", post(reject_change_event))
        .route("/api/change-events/{id}/sign", post(sign_change_event))
        .route("/api/change-events/{id}/history", get(change_event_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Handler error rendered as `{"error": "..."}` with a matching status.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Workflow(WorkflowError),
    Ingest(IngestError),
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self::Workflow(e)
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::Ingest(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Workflow(e) => match e {
                WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
                WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
                WorkflowError::InvalidToken | WorkflowError::TokenExpired => {
                    StatusCode::UNAUTHORIZED
                }
                WorkflowError::TokenAlreadyUsed => StatusCode::GONE,
                WorkflowError::Conflict { .. } | WorkflowError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                WorkflowError::Invalid(_) => StatusCode::BAD_REQUEST,
                WorkflowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Ingest(e) => match e {
                IngestError::UnknownProject(_) => StatusCode::NOT_FOUND,
                IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
                IngestError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
                IngestError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::BadRequest(m) | Self::Unauthorized(m) | Self::NotFound(m) => m.clone(),
            Self::Workflow(e) => e.to_string(),
            Self::Ingest(e) => e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.message(), "Request failed");
            // Storage details stay in the log
            return (
                status,
                Json(serde_json::json!({"error": "Internal error"})),
            )
                .into_response();
        }
        (status, Json(serde_json::json!({"error": self.message()}))).into_response()
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid {what} ID")))
}

fn contractor_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get(CONTRACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("Missing {CONTRACTOR_HEADER} header")))?;
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::BadRequest("Invalid contractor ID".into()))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "site-trace"
    }))
}

// ── Ingestion ───────────────────────────────────────────────────────────

/// POST /api/ingest
///
/// 201 with the new event, or 200 with the stored one on re-delivery.
async fn submit_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewIngestEvent>,
) -> Result<Response, ApiError> {
    let contractor = if headers.contains_key(CONTRACTOR_HEADER) {
        Some(contractor_id(&headers)?)
    } else {
        None
    };
    let submission = state.ingest.submit(body, contractor).await?;
    let status = if submission.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(submission.event)).into_response())
}

/// GET /api/ingest/{id}
async fn get_ingest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "ingest event")?;
    match state.ingest.get(id).await? {
        Some(event) => Ok(Json(event).into_response()),
        None => Err(ApiError::NotFound("Ingest event not found".into())),
    }
}

// ── Change events ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
}

/// GET /api/projects/{id}/change-events?status=&offset=&limit=
async fn list_change_events(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let project_id = parse_id(&project_id, "project")?;
    let contractor = contractor_id(&headers)?;
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            ChangeEventStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown status: {s}")))
        })
        .transpose()?;
    let query = ChangeEventQuery {
        status,
        offset: params.offset.unwrap_or(0),
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    };
    let events = state
        .workflow
        .list_for_project(project_id, contractor, &query)
        .await?;
    Ok(Json(events).into_response())
}

/// POST /api/projects/{id}/change-events/manual
async fn create_manual_change_event(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(draft): Json<ManualChangeDraft>,
) -> Result<Response, ApiError> {
    let project_id = parse_id(&project_id, "project")?;
    let contractor = contractor_id(&headers)?;
    let created = state
        .workflow
        .create_manual(project_id, contractor, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

/// PUT /api/change-events/{id}
async fn edit_change_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(edit): Json<ChangeEventEdit>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "change event")?;
    let contractor = contractor_id(&headers)?;
    let edited = state.workflow.edit(id, contractor, edit).await?;
    Ok(Json(edited).into_response())
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    token: String,
    #[serde(default)]
    reason: Option<String>,
}

/// POST /api/change-events/{id}/confirm?token=
async fn confirm_change_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "change event")?;
    let confirmed = state.workflow.confirm(id, &params.token).await?;
    info!(change_event_id = %id, "Confirmed via link");
    Ok(Json(confirmed).into_response())
}

/// POST /api/change-events/{id}/reject?token=&reason=
async fn reject_change_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "change event")?;
    let rejected = state
        .workflow
        .reject(id, &params.token, params.reason)
        .await?;
    info!(change_event_id = %id, "Rejected via link");
    Ok(Json(rejected).into_response())
}

/// POST /api/change-events/{id}/sign?token=
async fn sign_change_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TokenParams>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "change event")?;
    let signed = state.workflow.sign(id, &params.token).await?;
    info!(change_event_id = %id, "Signed by client");
    Ok(Json(signed).into_response())
}

/// GET /api/change-events/{id}/history
async fn change_event_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "change event")?;
    let history = state.workflow.history(id).await?;
    Ok(Json(history).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn workflow_errors_map_to_distinct_statuses() {
        let id = Uuid::new_v4();
        let cases = [
            (
                WorkflowError::NotFound {
                    entity: "change_event",
                    id,
                },
                StatusCode::NOT_FOUND,
            ),
            (WorkflowError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (WorkflowError::InvalidToken, StatusCode::UNAUTHORIZED),
            (WorkflowError::TokenExpired, StatusCode::UNAUTHORIZED),
            (WorkflowError::TokenAlreadyUsed, StatusCode::GONE),
            (
                WorkflowError::Conflict {
                    id,
                    current: "rejected".into(),
                    expected: "proposed".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                WorkflowError::InvalidTransition {
                    id,
                    from: "rejected".into(),
                    to: "confirmed".into(),
                },
                StatusCode::CONFLICT,
            ),
            (WorkflowError::Invalid("x".into()), StatusCode::BAD_REQUEST),
            (
                WorkflowError::Database(DatabaseError::Query("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    async fn app() -> Router {
        use crate::changes::tokens::ActionTokenService;
        use crate::ingest::routing::ProjectRouter;
        use crate::notify::EventBus;
        use crate::store::{Database, LibSqlBackend};
        use crate::worker::ProcessingQueue;
        use std::sync::Arc;
        use std::time::Duration;

        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (queue, _rx) = ProcessingQueue::new(8);
        let tokens = ActionTokenService::new(db.clone(), Duration::from_secs(60));
        api_routes(AppState {
            ingest: IngestService::new(db.clone(), queue, ProjectRouter::new()),
            workflow: Workflow::new(db, tokens, EventBus::new()),
        })
    }

    async fn call(app: Router, request: axum::http::Request<axum::body::Body>) -> StatusCode {
        use tower::ServiceExt;
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn routes_reject_bad_input() {
        use axum::body::Body;
        use axum::http::Request;

        let get = |uri: &str| Request::get(uri).body(Body::empty()).unwrap();
        assert_eq!(call(app().await, get("/health")).await, StatusCode::OK);
        assert_eq!(
            call(app().await, get("/api/ingest/not-a-uuid")).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            call(app().await, get(&format!("/api/ingest/{}", Uuid::new_v4()))).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            call(
                app().await,
                get(&format!("/api/projects/{}/change-events", Uuid::new_v4()))
            )
            .await,
            StatusCode::UNAUTHORIZED
        );
        let confirm = Request::post(format!(
            "/api/change-events/{}/confirm?token=bogus",
            Uuid::new_v4()
        ))
        .body(Body::empty())
        .unwrap();
        assert_eq!(call(app().await, confirm).await, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn contractor_header_is_required_and_parsed() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            contractor_id(&headers),
            Err(ApiError::Unauthorized(_))
        ));
        headers.insert(CONTRACTOR_HEADER, "not-a-uuid".parse().unwrap());
        assert!(matches!(contractor_id(&headers), Err(ApiError::BadRequest(_))));
        let id = Uuid::new_v4();
        headers.insert(CONTRACTOR_HEADER, id.to_string().parse().unwrap());
        assert_eq!(contractor_id(&headers).unwrap(), id);
    }
}
