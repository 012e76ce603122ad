//! HTTP surface: lead capture, the admin process trigger and the webhook
//! receivers for SMS replies, bookings, call outcomes and applications.

pub mod events;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::{LeadProcessor, Trigger};
use crate::error::{Error, LeadError};

pub use events::{
    ApplicationEvent, ApplicationEventKind, BookingEvent, BookingEventKind, CallOutcome,
    CallOutcomeEvent, CaptureLead, EventHandler, EventOutcome, InboundSms,
};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<LeadProcessor>,
    pub events: Arc<EventHandler>,
}

/// Maps service errors to HTTP responses.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Lead(LeadError::NotFound(_) | LeadError::AppointmentNotFound(_))
            | Error::Lead(LeadError::UnknownBooking(_)) => StatusCode::NOT_FOUND,
            Error::Lead(LeadError::InvalidEvent(_)) => StatusCode::BAD_REQUEST,
            Error::Lead(LeadError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /api/leads
///
/// Captures a lead and, when it is new, starts its first touch in the
/// background.
async fn capture_lead(
    State(state): State<AppState>,
    Json(input): Json<CaptureLead>,
) -> Result<Response, ApiError> {
    let (lead, created) = state.events.capture_lead(input, Utc::now()).await?;
    if !created {
        return Ok((StatusCode::OK, Json(lead)).into_response());
    }

    let processor = Arc::clone(&state.processor);
    let lead_id = lead.id;
    tokio::spawn(async move {
        processor.process(lead_id, Trigger::Sweep).await;
    });
    Ok((StatusCode::CREATED, Json(lead)).into_response())
}

/// POST /api/leads/{id}/process
async fn process_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    if state.processor.store().get_lead(id).await.map_err(Error::from)?.is_none() {
        return Err(Error::from(LeadError::NotFound(id)).into());
    }
    let outcome = state.processor.process(id, Trigger::Manual).await;
    Ok(Json(outcome).into_response())
}

/// POST /webhooks/sms
async fn inbound_sms(
    State(state): State<AppState>,
    Form(sms): Form<InboundSms>,
) -> Result<Json<EventOutcome>, ApiError> {
    Ok(Json(state.events.inbound_sms(sms, Utc::now()).await?))
}

/// POST /webhooks/booking
async fn booking(
    State(state): State<AppState>,
    Json(event): Json<BookingEvent>,
) -> Result<Json<EventOutcome>, ApiError> {
    Ok(Json(state.events.booking(event, Utc::now()).await?))
}

/// POST /webhooks/calls/{appointment_id}/outcome
async fn call_outcome(
    State(state): State<AppState>,
    Path(appointment_id): Path<Uuid>,
    Json(event): Json<CallOutcomeEvent>,
) -> Result<Json<EventOutcome>, ApiError> {
    Ok(Json(
        state
            .events
            .call_outcome(appointment_id, event, Utc::now())
            .await?,
    ))
}

/// POST /webhooks/application
async fn application(
    State(state): State<AppState>,
    Json(event): Json<ApplicationEvent>,
) -> Result<Json<EventOutcome>, ApiError> {
    Ok(Json(state.events.application(event, Utc::now()).await?))
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/leads", post(capture_lead))
        .route("/api/leads/{id}/process", post(process_lead))
        .route("/webhooks/sms", post(inbound_sms))
        .route("/webhooks/booking", post(booking))
        .route("/webhooks/calls/{appointment_id}/outcome", post(call_outcome))
        .route("/webhooks/application", post(application))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
