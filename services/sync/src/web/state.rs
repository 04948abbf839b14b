//! services/sync/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::adapters::WebhookHub;
use crate::config::Config;
use spirit_core::ports::{RemoteStore, ScrapeService};
use spirit_core::{MatchFeed, SessionStore};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub feed: MatchFeed,
    pub session: Arc<SessionStore>,
    pub store: Arc<dyn RemoteStore>,
    /// Ingress side of the realtime transport the feed listens on.
    pub hub: WebhookHub,
    /// Absent when no scraping function is configured.
    pub scrape: Option<Arc<dyn ScrapeService>>,
}
