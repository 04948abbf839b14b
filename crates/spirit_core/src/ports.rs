//! crates/spirit_core/src/ports.rs
//!
//! Defines the contracts (traits) for everything the sync core consumes.
//! These traits form the boundary of the hexagonal architecture: the remote
//! store, its realtime transport, the client-local token storage, and the
//! scraping function are all injected, so the core runs against fakes in tests
//! and against real adapters in the service.

use crate::domain::{
    AuthSession, ChannelMessage, ChannelSpec, EventRow, GroupRecord, MatchRow, Profile,
    TargetKind, ThoughtRecord, ThoughtTarget,
};
use async_trait::async_trait;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Malformed payload: {0}")]
    Decode(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// The message stream of one open realtime channel.
pub type ChannelStream = Pin<Box<dyn Stream<Item = ChannelMessage> + Send>>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Query side of the hosted store. Each method corresponds to one query shape
/// and returns typed rows; adapters parse at their boundary.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    // --- Events ---
    async fn fetch_events(&self) -> PortResult<Vec<EventRow>>;

    async fn fetch_enrollment_counts(&self, event_ids: &[Uuid]) -> PortResult<HashMap<Uuid, u32>>;

    // --- Matches ---
    /// All matches with participants and their profiles joined.
    async fn fetch_matches(&self) -> PortResult<Vec<MatchRow>>;

    /// A single match in the same joined shape. `NotFound` when the row is gone.
    async fn fetch_match(&self, match_id: Uuid) -> PortResult<MatchRow>;

    async fn fetch_groups(&self, group_ids: &[Uuid]) -> PortResult<Vec<GroupRecord>>;

    // --- Thoughts ---
    async fn fetch_thought_counts(
        &self,
        kind: TargetKind,
        target_ids: &[Uuid],
    ) -> PortResult<HashMap<Uuid, u32>>;

    async fn fetch_thoughts(&self, target: ThoughtTarget) -> PortResult<Vec<ThoughtRecord>>;

    // --- Profiles ---
    async fn fetch_profile(&self, user_id: Uuid) -> PortResult<Profile>;
}

/// Opens realtime channels on the store's change feed.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Opens a channel. The stream yields status updates and raw changes until
    /// the channel ends; dropping the stream unsubscribes.
    async fn open(&self, spec: &ChannelSpec) -> PortResult<ChannelStream>;
}

/// Client-local token storage. Every method is a synchronous local read or
/// write and must never block on the network.
pub trait SessionPersistence: Send + Sync {
    fn load(&self) -> PortResult<Option<AuthSession>>;
    fn save(&self, session: &AuthSession) -> PortResult<()>;
    fn clear(&self) -> PortResult<()>;
}

#[async_trait]
pub trait ScrapeService: Send + Sync {
    /// Asks the scraping function to read an external booking page.
    async fn scrape(&self, url: &str) -> PortResult<serde_json::Value>;
}
