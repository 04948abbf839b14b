//! services/sync/src/web/hooks.rs
//!
//! Ingress for the backend's webhooks: row changes feed the realtime hub, and
//! auth-state changes feed the session store.

use crate::adapters::WebhookPayload;
use crate::error::SyncError;
use crate::web::state::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spirit_core::domain::{AuthEvent, AuthSession, RawChange};
use spirit_core::AuthTransition;
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RealtimeHookResponse {
    /// How many open channels received the change.
    pub delivered: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AuthHookPayload {
    /// `SIGNED_IN`, `TOKEN_REFRESHED` or `SIGNED_OUT`.
    pub event: String,
    pub user_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthHookPayload {
    fn into_event(self) -> Result<AuthEvent, SyncError> {
        let session = |user_id: Option<Uuid>| {
            user_id
                .map(|user_id| AuthSession {
                    user_id,
                    expires_at: self.expires_at,
                })
                .ok_or_else(|| SyncError::BadRequest(format!("{} requires a user_id", self.event)))
        };
        match self.event.to_ascii_uppercase().as_str() {
            "SIGNED_IN" => Ok(AuthEvent::SignedIn(session(self.user_id)?)),
            "TOKEN_REFRESHED" => Ok(AuthEvent::TokenRefreshed(session(self.user_id)?)),
            "SIGNED_OUT" => Ok(AuthEvent::SignedOut),
            other => Err(SyncError::BadRequest(format!("unknown auth event '{}'", other))),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AuthHookResponse {
    /// What the session store did with the event.
    pub transition: String,
    /// The viewer after the event.
    pub user_id: Option<Uuid>,
}

fn describe(transition: &AuthTransition) -> &'static str {
    match transition {
        AuthTransition::Adopted(_) => "adopted",
        AuthTransition::Restored(_) => "restored",
        AuthTransition::KeptFallback(_) => "kept_fallback",
        AuthTransition::Cleared => "cleared",
        AuthTransition::Unchanged => "unchanged",
    }
}

/// Receive one row change from a database webhook.
#[utoipa::path(
    post,
    path = "/hooks/realtime",
    request_body = WebhookPayload,
    responses(
        (status = 202, description = "Change accepted", body = RealtimeHookResponse),
        (status = 401, description = "Missing or wrong webhook secret")
    )
)]
pub async fn realtime_hook_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, Json<RealtimeHookResponse>) {
    debug!(table = %payload.table, kind = %payload.event_type, "Webhook change received");
    let delivered = app_state.hub.publish(RawChange::from(payload));
    (StatusCode::ACCEPTED, Json(RealtimeHookResponse { delivered }))
}

/// Receive an auth-state change for the local session.
#[utoipa::path(
    post,
    path = "/hooks/auth",
    request_body = AuthHookPayload,
    responses(
        (status = 200, description = "Event applied", body = AuthHookResponse),
        (status = 400, description = "Unknown event or missing user id"),
        (status = 401, description = "Missing or wrong webhook secret")
    )
)]
pub async fn auth_hook_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<AuthHookPayload>,
) -> Result<Json<AuthHookResponse>, SyncError> {
    let event = payload.into_event()?;
    let transition = app_state.session.on_auth_change(event).await;
    info!(transition = describe(&transition), "Auth event applied");
    Ok(Json(AuthHookResponse {
        transition: describe(&transition).to_string(),
        user_id: app_state.session.current_user_id(),
    }))
}
