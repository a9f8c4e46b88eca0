use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::advice::AdviceService;
use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::line::LineClient;
use crate::matching::{CandidateRanker, MatchError, MatchService, PersonalityScorer};
use crate::models::{
    AdviceRequest, AdviceResponse, MatchRequest, MatchResponse, PhotoCaptureRequest,
    ReminderReport,
};
use crate::photo::{prepare_image, PhotoError, PhotoExtractor};
use crate::records;
use crate::reminders::ReminderService;
use crate::supabase::{DataError, SupabaseClient};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub supabase: SupabaseClient,
    pub matcher: MatchService,
    pub advice: AdviceService,
    pub photos: PhotoExtractor,
    pub reminders: ReminderService,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        let supabase = SupabaseClient::new(&config.supabase, timeout)?;
        let gemini = GeminiClient::new(&config.gemini)?;
        let line = LineClient::new(&config.line, timeout)?;

        let scorer = PersonalityScorer::new(
            Arc::new(gemini.clone()),
            Duration::from_millis(config.matching.embed_timeout_ms.max(1)),
            config.matching.embed_retries,
        );
        let ranker = CandidateRanker::new(
            scorer,
            config.matching.distance_weight,
            config.matching.embed_concurrency,
        )
        .with_scoring_deadline(config.scoring_deadline());

        Ok(Self {
            matcher: MatchService::new(supabase.clone(), ranker),
            advice: AdviceService::new(supabase.clone(), gemini.clone()),
            photos: PhotoExtractor::new(gemini),
            reminders: ReminderService::new(supabase.clone(), line, config.local_offset()),
            supabase,
            config,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let timeout = state.config.request_timeout();

    Router::new()
        .route("/health", get(health))
        .route("/match", post(match_volunteers))
        .route("/advice", post(get_advice))
        .route("/photo-capture", post(photo_capture))
        .route("/check-reminders", get(check_reminders))
        .merge(records::routes())
        .layer(TimeoutLayer::new(timeout))
        .layer(middleware::map_response(timeout_envelope))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_server(state: AppState) -> Result<()> {
    let addr: SocketAddr = state.config.bind_addr.parse()?;
    let app = build_router(state);

    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(allowed)
    }
}

/// The timeout layer answers with a bare 408; give it the usual error body.
async fn timeout_envelope(response: Response) -> Response {
    if response.status() == StatusCode::REQUEST_TIMEOUT {
        return ApiError::new(StatusCode::REQUEST_TIMEOUT, "request timed out").into_response();
    }
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn match_volunteers(
    State(state): State<AppState>,
    payload: Result<Json<MatchRequest>, JsonRejection>,
) -> Result<Json<MatchResponse>, ApiError> {
    let request = json_body(payload)?;
    let matches = state.matcher.find_volunteers(&request).await?;
    tracing::info!(count = matches.len(), "volunteer match complete");
    Ok(Json(MatchResponse::from_matches(matches)))
}

async fn get_advice(
    State(state): State<AppState>,
    payload: Result<Json<AdviceRequest>, JsonRejection>,
) -> Result<Json<AdviceResponse>, ApiError> {
    let request = json_body(payload)?;
    let elder_user_id = request
        .elder_user_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("elder_user_id is required"))?;

    Ok(Json(state.advice.advise(elder_user_id).await?))
}

async fn photo_capture(
    State(state): State<AppState>,
    payload: Result<Json<PhotoCaptureRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request = json_body(payload)?;
    let raw = request
        .base64
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("no image data received"))?;

    let image = prepare_image(raw, request.mime_type.as_deref())?;
    let data = state.photos.extract(&image).await?;
    Ok(Json(json!({ "success": true, "data": data })))
}

async fn check_reminders(State(state): State<AppState>) -> Result<Json<ReminderReport>, ApiError> {
    let report = state.reminders.run_once(Utc::now()).await?;
    Ok(Json(report))
}

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    raw_text: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            raw_text: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{value:#}"))
    }
}

impl From<DataError> for ApiError {
    fn from(value: DataError) -> Self {
        match value {
            DataError::Rejected { message, .. } => Self::bad_request(message),
            DataError::Unavailable(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
            }
        }
    }
}

impl From<MatchError> for ApiError {
    fn from(value: MatchError) -> Self {
        match value {
            MatchError::InvalidRequest(message) => Self::bad_request(message),
            MatchError::ElderNotFound(_) => Self::not_found(value.to_string()),
            MatchError::Upstream(err) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }
}

impl From<PhotoError> for ApiError {
    fn from(value: PhotoError) -> Self {
        match value {
            PhotoError::InvalidImage(message) => Self::bad_request(message),
            PhotoError::Unparseable { raw_text } => Self {
                status: StatusCode::BAD_GATEWAY,
                message: "model reply could not be parsed as JSON".to_string(),
                raw_text: Some(raw_text),
            },
            PhotoError::Provider(err) => Self::new(StatusCode::BAD_GATEWAY, format!("{err:#}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "request failed: {}", self.message);
        } else {
            tracing::warn!(status = %self.status, "request rejected: {}", self.message);
        }

        let mut body = json!({ "success": false, "message": self.message });
        if let Some(raw_text) = self.raw_text {
            body["rawText"] = json!(raw_text);
        }
        (self.status, Json(body)).into_response()
    }
}
