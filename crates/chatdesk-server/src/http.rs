use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use chatdesk_core::chat::{ChatSession, Participant, SessionStatus, SessionSummary, SurveyData};
use chatdesk_core::identity::{Identity, GUEST_DISPLAY_NAME};
use chatdesk_core::ChatError;
use chatdesk_telemetry::{LogQuery, LogRecord};

use crate::broker::parse_session_id;
use crate::server::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;
const MAX_DISPLAY_NAME: usize = 80;

/// `ChatError` rendered as `{code, message}` with a matching status.
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::InvalidInput(_) | ChatError::SurveyRejected(_) => StatusCode::BAD_REQUEST,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::SessionBusy(_) | ChatError::IllegalTransition { .. } => StatusCode::CONFLICT,
            ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(kind = self.0.error_kind(), error = %self.0, "request failed");
        }
        let body = json!({ "code": self.0.error_kind(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/chat/start", post(start_chat))
        .route("/chat/{id}", get(get_chat))
        .route("/chat/{id}/survey", post(submit_survey))
        .route("/admin/chats", get(list_chats))
        .route("/admin/chats/{id}/close", put(close_chat))
        .route("/admin/logs", get(list_logs))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Identity {
    state.broker.resolver().resolve(bearer(headers)).await
}

async fn require_agent(state: &AppState, headers: &HeaderMap) -> ApiResult<Identity> {
    let identity = caller(state, headers).await;
    if identity.is_agent() {
        Ok(identity)
    } else {
        Err(ChatError::Forbidden("agent credential required".into()).into())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChatRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartChatResponse {
    session_id: String,
    status: SessionStatus,
}

async fn start_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartChatRequest>,
) -> ApiResult<(StatusCode, Json<StartChatResponse>)> {
    let identity = caller(&state, &headers).await;
    let participant = match identity.account_id {
        Some(account_id) => Participant::Account {
            account_id,
            display_name: identity.display_name,
        },
        None => guest_participant(body)?,
    };

    let session = state.broker.create_session(participant).await?;
    Ok((
        StatusCode::CREATED,
        Json(StartChatResponse {
            session_id: session.id.to_string(),
            status: session.status,
        }),
    ))
}

fn guest_participant(body: StartChatRequest) -> Result<Participant, ChatError> {
    let display_name = body
        .display_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| GUEST_DISPLAY_NAME.to_string());
    if display_name.chars().count() > MAX_DISPLAY_NAME {
        return Err(ChatError::InvalidInput("displayName is too long".into()));
    }

    let contact_email = body
        .contact_email
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if let Some(email) = &contact_email {
        if !email.contains('@') {
            return Err(ChatError::InvalidInput(format!("invalid contactEmail: {email}")));
        }
    }

    Ok(Participant::Guest {
        display_name,
        contact_email,
    })
}

async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChatSession>> {
    let id = parse_session_id(&id)?;
    let session = state.broker.with_sessions(move |s| s.get(&id)).await?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SurveyResponse {
    survey_completed: bool,
}

async fn submit_survey(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(survey): Json<SurveyData>,
) -> ApiResult<Json<SurveyResponse>> {
    let id = parse_session_id(&id)?;
    if !survey.is_valid() {
        return Err(ChatError::InvalidInput(format!(
            "rating must be between {} and {}",
            SurveyData::MIN_RATING,
            SurveyData::MAX_RATING
        ))
        .into());
    }
    let summary = state.broker.submit_survey(&id, survey).await?;
    Ok(Json(SurveyResponse {
        survey_completed: summary.survey_completed,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListChatsParams {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

async fn list_chats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListChatsParams>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    require_agent(&state, &headers).await?;

    let status = params
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(ChatError::InvalidInput)?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = params.offset.unwrap_or(0);

    let summaries = state
        .broker
        .with_sessions(move |s| s.list_summaries(status, limit, offset))
        .await?;
    Ok(Json(summaries))
}

async fn close_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSummary>> {
    let agent = require_agent(&state, &headers).await?;
    let id = parse_session_id(&id)?;
    let summary = state.broker.close(&id).await?;
    tracing::info!(session_id = %id, agent = %agent.display_name, "closed by agent");
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsParams {
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub kind: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

async fn list_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LogsParams>,
) -> ApiResult<Json<Vec<LogRecord>>> {
    require_agent(&state, &headers).await?;

    let Some(sink) = state.telemetry.logs() else {
        return Ok(Json(Vec::new()));
    };
    let query = LogQuery {
        level: params.level,
        target: None,
        session_id: params.session_id,
        kind: params.kind,
        since: params.since,
        limit: Some(params.limit.unwrap_or(100).min(MAX_PAGE)),
    };
    let records = sink
        .query(&query)
        .map_err(|e| ChatError::Persistence(format!("log query failed: {e}")))?;
    Ok(Json(records))
}
