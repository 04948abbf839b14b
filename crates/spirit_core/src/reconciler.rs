//! crates/spirit_core/src/reconciler.rs
//!
//! The list reconciler: keeps an ordered in-memory list of matches current by
//! applying individual change notifications instead of refetching the collection.
//!
//! Per match id the lifecycle is
//! `absent -> insert -> present -> update* -> delete -> absent (suppressed) -> absent`.
//! Suppression only blocks refreshes triggered by child rows (participants,
//! thoughts); a direct insert of a suppressed id is a re-created match and is
//! honored.
//!
//! Fetches are not serialized: when two fetches for one id race, whichever
//! resolves last owns the slot. A fetch that began before a delete of its id is
//! discarded, so a slow read can never resurrect a deleted match. Full loads
//! follow the same rule through `begin_load`/`replace_all`.

use crate::domain::{ChangeEvent, ChangeKind, Collection, MatchRecord};
use crate::enrich::{fetch_enriched_match, sort_by_schedule};
use crate::listener::ChangeHandler;
use crate::ports::{PortError, RemoteStore};
use crate::session::SessionStore;
use crate::suppression::{RecentlyDeleted, DEFAULT_SUPPRESSION_WINDOW};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Supplies the current viewer for visibility checks.
pub trait ViewerSource: Send + Sync {
    fn viewer_id(&self) -> Option<Uuid>;
}

impl ViewerSource for SessionStore {
    fn viewer_id(&self) -> Option<Uuid> {
        self.current_user_id()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// How long a deleted match id blocks child-triggered refreshes.
    pub suppression_window: Duration,
    /// Re-apply the visibility rule to every single-record fetch. Off by default:
    /// only full loads filter by viewer.
    pub recheck_visibility: bool,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            suppression_window: DEFAULT_SUPPRESSION_WINDOW,
            recheck_visibility: false,
        }
    }
}

#[derive(Debug)]
struct ListState {
    matches: Vec<MatchRecord>,
    deleted: RecentlyDeleted,
    /// Bumped on every delete and on every single-record write to the list.
    generation: u64,
    /// Generation of the last delete per id. Entries live only while a fetch or
    /// load that began before them is still pending.
    deleted_at: HashMap<Uuid, u64>,
    /// Generation of the last single-record write per id, same retention.
    written_at: HashMap<Uuid, u64>,
    /// Generations captured by pending fetches and loads, with their counts.
    pending: BTreeMap<u64, usize>,
}

impl ListState {
    fn new(deleted: RecentlyDeleted) -> Self {
        Self {
            matches: Vec::new(),
            deleted,
            generation: 0,
            deleted_at: HashMap::new(),
            written_at: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.matches.iter().position(|m| m.id == id)
    }

    fn upsert(&mut self, record: MatchRecord) {
        match self.position(record.id) {
            Some(index) => self.matches[index] = record,
            None => {
                self.matches.push(record);
                sort_by_schedule(&mut self.matches);
            }
        }
    }

    fn remove(&mut self, id: Uuid) -> bool {
        let before = self.matches.len();
        self.matches.retain(|m| m.id != id);
        self.matches.len() != before
    }

    fn parent_of_participant(&self, participant_id: Uuid) -> Option<Uuid> {
        self.matches
            .iter()
            .find(|m| m.has_participant(participant_id))
            .map(|m| m.id)
    }

    fn capture(&mut self) -> u64 {
        *self.pending.entry(self.generation).or_default() += 1;
        self.generation
    }

    fn release(&mut self, generation: u64) {
        if let Some(count) = self.pending.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&generation);
            }
        }
        self.prune();
    }

    fn record_delete(&mut self, id: Uuid) {
        self.generation += 1;
        if !self.pending.is_empty() {
            self.deleted_at.insert(id, self.generation);
        }
    }

    fn record_write(&mut self, id: Uuid) {
        self.generation += 1;
        if !self.pending.is_empty() {
            self.written_at.insert(id, self.generation);
        }
    }

    fn deleted_since(&self, id: Uuid, generation: u64) -> bool {
        self.deleted_at.get(&id).is_some_and(|at| *at > generation)
    }

    fn written_since(&self, id: Uuid, generation: u64) -> bool {
        self.written_at.get(&id).is_some_and(|at| *at > generation)
    }

    /// Forgets changes no pending fetch or load can still be compared against.
    fn prune(&mut self) {
        match self.pending.keys().next().copied() {
            Some(oldest) => {
                self.deleted_at.retain(|_, at| *at > oldest);
                self.written_at.retain(|_, at| *at > oldest);
            }
            None => {
                self.deleted_at.clear();
                self.written_at.clear();
            }
        }
    }
}

/// Marks the list generation a fetch or load started from. Released on drop,
/// whether or not the work completed.
struct Capture {
    inner: Arc<Inner>,
    generation: u64,
}

impl Drop for Capture {
    fn drop(&mut self) {
        lock(&self.inner.state).release(self.generation);
    }
}

/// Taken before a full load starts; hand it back to `replace_all` with the result.
pub struct LoadTicket {
    capture: Capture,
}

/// How a completed fetch may be written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// Match-level notification: replace in place or insert.
    Upsert,
    /// Child notification: replace in place only, and only while not suppressed.
    ReplaceOnly,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    viewer: Arc<dyn ViewerSource>,
    options: ReconcilerOptions,
    state: Mutex<ListState>,
    teardown: CancellationToken,
}

/// Owns one in-memory match list. Clones share the same list.
#[derive(Clone)]
pub struct MatchReconciler {
    inner: Arc<Inner>,
}

impl MatchReconciler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        viewer: Arc<dyn ViewerSource>,
        options: ReconcilerOptions,
    ) -> Self {
        let deleted = RecentlyDeleted::new(options.suppression_window);
        Self {
            inner: Arc::new(Inner {
                store,
                viewer,
                options,
                state: Mutex::new(ListState::new(deleted)),
                teardown: CancellationToken::new(),
            }),
        }
    }

    //-------------------------------------------------------------------------------------
    // Reads
    //-------------------------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<MatchRecord> {
        self.state().matches.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<MatchRecord> {
        let state = self.state();
        state.position(id).map(|i| state.matches[i].clone())
    }

    pub fn len(&self) -> usize {
        self.state().matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_suppressed(&self, id: Uuid) -> bool {
        self.state().deleted.contains(id)
    }

    //-------------------------------------------------------------------------------------
    // Writes
    //-------------------------------------------------------------------------------------

    /// Marks the start of a full load. Changes reconciled from here on take
    /// precedence over what the load returns.
    pub fn begin_load(&self) -> LoadTicket {
        LoadTicket {
            capture: self.capture(),
        }
    }

    /// Installs a freshly bootstrapped list. Ids deleted while the load was in
    /// flight stay out, and records written meanwhile keep their newer copy.
    pub fn replace_all(&self, matches: Vec<MatchRecord>, ticket: LoadTicket) {
        let since = ticket.capture.generation;
        let mut state = self.state();

        let mut merged: Vec<MatchRecord> = matches
            .into_iter()
            .filter(|m| {
                if state.deleted_since(m.id, since) {
                    debug!(match_id = %m.id, "Dropping match deleted during load");
                    return false;
                }
                !state.written_since(m.id, since)
            })
            .collect();
        merged.extend(
            state
                .matches
                .iter()
                .filter(|m| state.written_since(m.id, since))
                .cloned(),
        );
        sort_by_schedule(&mut merged);
        state.matches = merged;

        drop(state);
        drop(ticket);
    }

    /// After teardown, completing fetches are dropped instead of applied.
    pub fn teardown(&self) {
        self.inner.teardown.cancel();
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.teardown.is_cancelled()
    }

    pub async fn apply_insert(&self, id: Uuid) {
        self.refresh_task(id, Refresh::Upsert).await
    }

    pub async fn apply_update(&self, id: Uuid) {
        self.refresh_task(id, Refresh::Upsert).await
    }

    /// Removes the match and suppresses child-triggered refreshes of it.
    /// Returns whether it was present.
    pub fn apply_delete(&self, id: Uuid) -> bool {
        let mut state = self.state();
        state.record_delete(id);
        state.deleted.mark(id);
        let removed = state.remove(id);
        if !removed {
            debug!(match_id = %id, "Delete for a match not in the list");
        }
        removed
    }

    /// Handles a participant or thought change by refreshing its parent match.
    /// Returns the refresh to run, or `None` when there is nothing to do.
    pub fn apply_child_change(&self, event: &ChangeEvent) -> Option<BoxFuture<'static, ()>> {
        let parent = {
            let state = self.state();
            let resolved = event.uuid_field("match_id").or_else(|| {
                // Deletes may carry only the child's own id.
                if event.collection != Collection::MatchParticipants {
                    return None;
                }
                event
                    .uuid_field("id")
                    .and_then(|child| state.parent_of_participant(child))
            });
            resolved
        };
        let Some(parent) = parent else {
            debug!(collection = %event.collection, "No parent match for child change");
            return None;
        };

        {
            let mut state = self.state();
            if state.deleted.contains(parent) {
                debug!(match_id = %parent, "Parent recently deleted, ignoring child change");
                return None;
            }
            if state.position(parent).is_none() {
                debug!(match_id = %parent, "Parent not in list, ignoring child change");
                return None;
            }
        }
        Some(self.refresh_task(parent, Refresh::ReplaceOnly))
    }

    /// Single entry point for change notifications from any match-related channel.
    pub fn dispatch(&self, event: ChangeEvent) -> Option<BoxFuture<'static, ()>> {
        match event.collection {
            Collection::Matches => {
                let Some(id) = event.uuid_field("id") else {
                    warn!("Match change without an id");
                    return None;
                };
                match event.kind {
                    ChangeKind::Insert | ChangeKind::Update => {
                        Some(self.refresh_task(id, Refresh::Upsert))
                    }
                    ChangeKind::Delete => {
                        self.apply_delete(id);
                        None
                    }
                }
            }
            Collection::MatchParticipants | Collection::Thoughts => self.apply_child_change(&event),
            other => {
                debug!(collection = %other, "Change not relevant to matches");
                None
            }
        }
    }

    /// Captures the list generation now, fetches later, and writes back only if
    /// no delete of the id happened in between.
    fn refresh_task(&self, id: Uuid, mode: Refresh) -> BoxFuture<'static, ()> {
        let capture = self.capture();
        let this = self.clone();
        async move {
            let record = match fetch_enriched_match(this.inner.store.as_ref(), id).await {
                Ok(record) => record,
                Err(PortError::NotFound(_)) => {
                    debug!(match_id = %id, "Match vanished before it could be fetched");
                    return;
                }
                Err(e) => {
                    warn!(match_id = %id, "Failed to refresh match: {}", e);
                    return;
                }
            };
            this.write_back(record, capture.generation, mode);
        }
        .boxed()
    }

    fn write_back(&self, record: MatchRecord, since: u64, mode: Refresh) {
        if self.is_torn_down() {
            return;
        }
        let viewer = self
            .inner
            .options
            .recheck_visibility
            .then(|| self.inner.viewer.viewer_id());

        let mut state = self.state();
        let id = record.id;
        if state.deleted_since(id, since) {
            debug!(match_id = %id, "Discarding fetch that raced a delete");
            return;
        }
        if mode == Refresh::ReplaceOnly
            && (state.deleted.contains(id) || state.position(id).is_none())
        {
            debug!(match_id = %id, "Parent gone before refresh completed");
            return;
        }
        if let Some(viewer) = viewer {
            if !record.is_visible_to(viewer) {
                debug!(match_id = %id, "Match no longer visible to viewer");
                state.remove(id);
                state.record_write(id);
                return;
            }
        }
        state.upsert(record);
        state.record_write(id);
    }

    fn capture(&self) -> Capture {
        let generation = self.state().capture();
        Capture {
            inner: self.inner.clone(),
            generation,
        }
    }

    #[cfg(test)]
    fn tracked_changes(&self) -> usize {
        let state = self.state();
        state.deleted_at.len() + state.written_at.len()
    }

    fn state(&self) -> MutexGuard<'_, ListState> {
        lock(&self.inner.state)
    }
}

fn lock(state: &Mutex<ListState>) -> MutexGuard<'_, ListState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChangeHandler for MatchReconciler {
    fn on_change(&self, event: ChangeEvent) -> Option<BoxFuture<'static, ()>> {
        self.dispatch(event)
    }
}
