//! services/sync/src/web/rest.rs
//!
//! Contains the Axum handlers for the read side of the feed, the scrape
//! pass-through, and the master definition for the OpenAPI specification.

use crate::error::SyncError;
use crate::web::hooks::{self, AuthHookPayload, AuthHookResponse, RealtimeHookResponse};
use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spirit_core::domain::{
    EventRecord, FeedAggregates, GroupRecord, MatchRecord, ParticipantRecord, ThoughtNode,
    ThoughtTarget,
};
use spirit_core::load_thought_forest;
use std::sync::Arc;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_matches_handler,
        list_events_handler,
        aggregates_handler,
        feed_errors_handler,
        session_handler,
        thoughts_handler,
        reload_handler,
        scrape_handler,
        hooks::realtime_hook_handler,
        hooks::auth_hook_handler,
    ),
    components(
        schemas(
            MatchView, ParticipantView, GroupView, EventView, AggregatesView, FeedStatusView,
            SessionView, ThoughtView, ScrapeRequest, AuthHookPayload, AuthHookResponse,
            RealtimeHookResponse,
        )
    ),
    tags(
        (
            name = "Spirit Sync API",
            description = "Read access to the reconciled community feed and its ingress hooks."
        )
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ParticipantView {
    pub id: Uuid,
    pub profile_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub rank: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl From<ParticipantRecord> for ParticipantView {
    fn from(p: ParticipantRecord) -> Self {
        Self {
            id: p.id,
            profile_id: p.profile_id,
            display_name: p.display_name,
            avatar_url: p.avatar_url,
            rank: p.rank,
            joined_at: p.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct GroupView {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl From<GroupRecord> for GroupView {
    fn from(g: GroupRecord) -> Self {
        Self {
            id: g.id,
            name: g.name,
            avatar_url: g.avatar_url,
        }
    }
}

/// A match as currently held by the reconciled feed.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MatchView {
    pub id: Uuid,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub location: Option<String>,
    pub created_by: Option<Uuid>,
    pub restricted: bool,
    pub participants: Vec<ParticipantView>,
    pub thoughts_count: u32,
    pub groups: Vec<GroupView>,
}

impl From<MatchRecord> for MatchView {
    fn from(m: MatchRecord) -> Self {
        Self {
            id: m.id,
            title: m.title,
            scheduled_at: m.scheduled_at,
            location: m.location,
            created_by: m.created_by,
            restricted: !m.restricted_users.is_empty(),
            participants: m.participants.into_iter().map(Into::into).collect(),
            thoughts_count: m.thoughts_count,
            groups: m.groups.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EventView {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub intention: Option<String>,
    pub enrollments_count: u32,
    pub thoughts_count: u32,
}

impl From<EventRecord> for EventView {
    fn from(e: EventRecord) -> Self {
        Self {
            id: e.id,
            title: e.title,
            starts_at: e.starts_at,
            location: e.location,
            tags: e.tags,
            intention: e.intention,
            enrollments_count: e.enrollments_count,
            thoughts_count: e.thoughts_count,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct AggregatesView {
    pub tags: Vec<String>,
    pub intentions: Vec<String>,
}

impl From<FeedAggregates> for AggregatesView {
    fn from(a: FeedAggregates) -> Self {
        Self {
            tags: a.tags.into_iter().collect(),
            intentions: a.intentions.into_iter().collect(),
        }
    }
}

/// Load failures plus enough state to tell whether the feed is live.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct FeedStatusView {
    pub errors: Vec<String>,
    pub channels: Vec<String>,
    pub matches: usize,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SessionView {
    pub user_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ThoughtView {
    pub id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[schema(no_recursion)]
    pub replies: Vec<ThoughtView>,
}

impl From<ThoughtNode> for ThoughtView {
    fn from(node: ThoughtNode) -> Self {
        Self {
            id: node.thought.id,
            author_id: node.thought.author_id,
            body: node.thought.body,
            created_at: node.thought.created_at,
            replies: node.replies.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ScrapeRequest {
    /// The external booking page to read.
    pub url: String,
}

fn feed_status(app_state: &AppState) -> FeedStatusView {
    FeedStatusView {
        errors: app_state.feed.errors(),
        channels: app_state.feed.active_channels(),
        matches: app_state.feed.reconciler().len(),
    }
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List the matches visible to the current viewer, ordered by schedule.
#[utoipa::path(
    get,
    path = "/matches",
    responses((status = 200, description = "The reconciled match list", body = Vec<MatchView>))
)]
pub async fn list_matches_handler(State(app_state): State<Arc<AppState>>) -> Json<Vec<MatchView>> {
    Json(app_state.feed.matches().into_iter().map(Into::into).collect())
}

/// List events with their enrollment and thought counts.
#[utoipa::path(
    get,
    path = "/events",
    responses((status = 200, description = "Events ordered by start time", body = Vec<EventView>))
)]
pub async fn list_events_handler(State(app_state): State<Arc<AppState>>) -> Json<Vec<EventView>> {
    Json(app_state.feed.events().into_iter().map(Into::into).collect())
}

/// Unique event tags and intentions from the last load.
#[utoipa::path(
    get,
    path = "/aggregates",
    responses((status = 200, description = "Filter facets", body = AggregatesView))
)]
pub async fn aggregates_handler(State(app_state): State<Arc<AppState>>) -> Json<AggregatesView> {
    Json(app_state.feed.aggregates().into())
}

#[utoipa::path(
    get,
    path = "/feed/errors",
    responses((
        status = 200,
        description = "Failures from the last load and live channels",
        body = FeedStatusView
    ))
)]
pub async fn feed_errors_handler(State(app_state): State<Arc<AppState>>) -> Json<FeedStatusView> {
    Json(feed_status(&app_state))
}

#[utoipa::path(
    get,
    path = "/session",
    responses((status = 200, description = "The current viewer", body = SessionView))
)]
pub async fn session_handler(State(app_state): State<Arc<AppState>>) -> Json<SessionView> {
    let session = app_state.session.session();
    let (display_name, avatar_url) = match session.profile {
        Some(p) => (p.display_name, p.avatar_url),
        None => (None, None),
    };
    Json(SessionView {
        user_id: session.user_id,
        display_name,
        avatar_url,
    })
}

/// The thread forest for one event or match.
#[utoipa::path(
    get,
    path = "/thoughts/{kind}/{id}",
    responses(
        (status = 200, description = "Root thoughts with nested replies", body = Vec<ThoughtView>),
        (status = 400, description = "Unknown target kind")
    ),
    params(
        ("kind" = String, Path, description = "`event` or `match`"),
        ("id" = Uuid, Path, description = "The event or match id")
    )
)]
pub async fn thoughts_handler(
    State(app_state): State<Arc<AppState>>,
    Path((kind, id)): Path<(String, Uuid)>,
) -> Result<Json<Vec<ThoughtView>>, SyncError> {
    let target = match kind.as_str() {
        "event" => ThoughtTarget::Event(id),
        "match" => ThoughtTarget::Match(id),
        other => return Err(SyncError::BadRequest(format!("unknown thought target '{}'", other))),
    };
    let policy = app_state.config.orphan_policy;
    let forest = load_thought_forest(app_state.store.as_ref(), target, policy).await?;
    Ok(Json(forest.into_iter().map(Into::into).collect()))
}

/// Reload everything for the current viewer.
#[utoipa::path(
    post,
    path = "/reload",
    responses((status = 200, description = "Feed reloaded", body = FeedStatusView))
)]
pub async fn reload_handler(State(app_state): State<Arc<AppState>>) -> Json<FeedStatusView> {
    info!("Manual feed reload requested");
    app_state.feed.reload().await;
    Json(feed_status(&app_state))
}

/// Read an external booking page through the scraping function.
#[utoipa::path(
    post,
    path = "/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Scraped data", body = Object),
        (status = 502, description = "The scraping function failed"),
        (status = 503, description = "No scraping function configured")
    )
)]
pub async fn scrape_handler(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let Some(scrape) = &app_state.scrape else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Scraping is not configured".to_string(),
        ));
    };
    if request.url.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "url is required".to_string()));
    }
    scrape
        .scrape(&request.url)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))
}
