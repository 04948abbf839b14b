//! crates/spirit_core/src/bootstrap.rs
//!
//! The bootstrap fetcher: the initial full load of events and matches, in the
//! same enriched shape single-record reconciliation produces, plus the filter
//! facets derived from the events.
//!
//! A failing query never fails the load. The affected list comes back empty (or
//! the affected counts as zero) and a readable message is added to `errors`.

use crate::domain::{
    is_visible, EventRecord, FeedAggregates, MatchRecord, MatchRow, TargetKind,
};
use crate::enrich::{enrich_match, index_groups, sort_by_schedule};
use crate::ports::{PortResult, RemoteStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Everything one bootstrap load produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub events: Vec<EventRecord>,
    pub matches: Vec<MatchRecord>,
    pub aggregates: FeedAggregates,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct BootstrapFetcher {
    store: Arc<dyn RemoteStore>,
}

impl BootstrapFetcher {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Loads events and the matches visible to `viewer`.
    pub async fn load_all(&self, viewer: Option<Uuid>) -> FeedSnapshot {
        let mut errors = Vec::new();

        let events = self.load_events(&mut errors).await;
        let aggregates = extract_aggregates(&events);
        let matches = self.load_matches(viewer, &mut errors).await;

        info!(
            events = events.len(),
            matches = matches.len(),
            failures = errors.len(),
            "Bootstrap load finished"
        );
        FeedSnapshot {
            events,
            matches,
            aggregates,
            errors,
        }
    }

    async fn load_events(&self, errors: &mut Vec<String>) -> Vec<EventRecord> {
        let rows = degrade(self.store.fetch_events().await, "events", errors);
        if rows.is_empty() {
            return Vec::new();
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let enrollments = degrade(
            self.store.fetch_enrollment_counts(&ids).await,
            "enrollment counts",
            errors,
        );
        let thoughts = degrade(
            self.store.fetch_thought_counts(TargetKind::Event, &ids).await,
            "event thought counts",
            errors,
        );

        let mut events: Vec<EventRecord> = rows
            .into_iter()
            .map(|row| EventRecord {
                enrollments_count: enrollments.get(&row.id).copied().unwrap_or(0),
                thoughts_count: thoughts.get(&row.id).copied().unwrap_or(0),
                id: row.id,
                title: row.title,
                starts_at: row.starts_at,
                location: row.location,
                tags: row.tags,
                intention: row.intention,
            })
            .collect();
        events.sort_by_key(|e| e.starts_at);
        events
    }

    async fn load_matches(
        &self,
        viewer: Option<Uuid>,
        errors: &mut Vec<String>,
    ) -> Vec<MatchRecord> {
        let rows: Vec<MatchRow> = degrade(self.store.fetch_matches().await, "matches", errors)
            .into_iter()
            .filter(|row| is_visible(&row.restricted_users, viewer))
            .collect();
        if rows.is_empty() {
            return Vec::new();
        }

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let counts: HashMap<Uuid, u32> = degrade(
            self.store.fetch_thought_counts(TargetKind::Match, &ids).await,
            "match thought counts",
            errors,
        );

        let group_ids: Vec<Uuid> = rows
            .iter()
            .flat_map(|r| r.group_ids.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let groups = if group_ids.is_empty() {
            HashMap::new()
        } else {
            index_groups(degrade(
                self.store.fetch_groups(&group_ids).await,
                "groups",
                errors,
            ))
        };

        let mut matches: Vec<MatchRecord> = rows
            .into_iter()
            .map(|row| {
                let count = counts.get(&row.id).copied().unwrap_or(0);
                enrich_match(row, count, &groups)
            })
            .collect();
        sort_by_schedule(&mut matches);
        matches
    }
}

/// Unique tags and intentions across all events.
pub fn extract_aggregates(events: &[EventRecord]) -> FeedAggregates {
    FeedAggregates {
        tags: events.iter().flat_map(|e| e.tags.iter().cloned()).collect(),
        intentions: events.iter().filter_map(|e| e.intention.clone()).collect(),
    }
}

/// Logs a failed query and substitutes an empty value.
fn degrade<T: Default>(result: PortResult<T>, what: &str, errors: &mut Vec<String>) -> T {
    result.unwrap_or_else(|e| {
        error!("Failed to load {}: {}", what, e);
        errors.push(format!("Could not load {}.", what));
        T::default()
    })
}
