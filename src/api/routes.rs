//! Handlers HTTP du pipeline (§6).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use validator::Validate;

use crate::api::state::AppState;
use crate::core::orchestrator::{ModerateOptions, OrchestrationOutcome};
use crate::error::PipelineError;
use crate::models::{IncomingMessage, ProcessedEvent};

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody {
            error: self.public_message(),
            severity: self.severity().to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    severity: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub environment: String,
    pub uptime_seconds: u64,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        environment: state.config.server.environment.to_string(),
        uptime_seconds: state.metrics.uptime().as_secs(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render().await
}

#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<String>,
}

pub async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(TemplateListResponse {
        templates: state.templates.list_allowlisted().await,
    })
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct ModerateRequest {
    #[validate(length(min = 1, message = "user_id must not be empty"))]
    pub user_id: String,
    pub username: String,
    #[validate(length(min = 1, message = "channel_id must not be empty"))]
    pub channel_id: String,
    pub body: String,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_deadline_ms() -> u64 {
    10_000
}

#[derive(Debug, Serialize)]
pub struct ModerateResponse {
    pub event: Option<ProcessedEvent>,
    pub duplicate: bool,
}

/// `POST /moderate` : exécute la chaîne complète C3→C4→C5→C8→C7→C10.
pub async fn moderate(
    State(state): State<AppState>,
    Json(request): Json<ModerateRequest>,
) -> Result<Json<ModerateResponse>, PipelineError> {
    validate_request(&request)?;

    let message = to_incoming_message(request.clone());
    let options = ModerateOptions {
        deadline: Instant::now() + Duration::from_millis(request.deadline_ms),
        template_name: request
            .template_name
            .unwrap_or_else(|| "moderation_prompt".to_string()),
    };

    match state.orchestrator.moderate(message, options).await {
        OrchestrationOutcome::Processed(event) => {
            state.metrics.message_processed().await;
            let decided = state.decision.handle(event).await;
            state
                .orchestrator
                .finalize_dedup(&decided.message_id, &decided)
                .await;
            Ok(Json(ModerateResponse {
                event: Some(decided),
                duplicate: false,
            }))
        }
        OrchestrationOutcome::Duplicate => Ok(Json(ModerateResponse {
            event: None,
            duplicate: true,
        })),
    }
}

/// `POST /filter` : n'exécute que le Lightweight Filter (C1+C2+C3), jamais le LLM.
pub async fn filter_only(
    State(state): State<AppState>,
    Json(request): Json<ModerateRequest>,
) -> Result<Json<crate::models::FilterOutcome>, PipelineError> {
    validate_request(&request)?;
    let message = to_incoming_message(request);
    Ok(Json(state.filter.evaluate(&message).await))
}

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub event: ProcessedEvent,
}

/// `POST /decide` : applique C8→C7→C10 à un événement déjà verdicté, pour
/// les intégrations qui ont leur propre oracle en amont de ce pipeline.
pub async fn decide(
    State(state): State<AppState>,
    Json(request): Json<DecideRequest>,
) -> Json<ProcessedEvent> {
    Json(state.decision.handle(request.event).await)
}

fn validate_request(request: &ModerateRequest) -> Result<(), PipelineError> {
    request
        .validate()
        .map_err(|errors| PipelineError::input_invalid(errors.to_string()))
}

fn to_incoming_message(request: ModerateRequest) -> IncomingMessage {
    let mut message = IncomingMessage::new(
        request.user_id,
        request.username,
        request.channel_id,
        request.body,
    );
    if message.exceeds_body_limit() {
        message.body = message.truncated_body();
    }
    message
}
