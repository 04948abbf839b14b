//! Test doubles for the core ports: a scriptable store, an injectable realtime
//! transport, and in-memory token storage.

use crate::domain::{
    AuthSession, ChannelMessage, ChannelSpec, ChannelStatus, EventRow, GroupRecord, MatchRow,
    ParticipantRow, Profile, RawChange, TargetKind, ThoughtRecord, ThoughtTarget,
};
use crate::ports::{
    ChannelStream, PortError, PortResult, RealtimeTransport, RemoteStore, SessionPersistence,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration as StdDuration;
use tokio::sync::oneshot;
use uuid::Uuid;

//=========================================================================================
// Fixtures
//=========================================================================================

pub fn at(hours: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
}

pub fn match_row(id: Uuid, hours: i64) -> MatchRow {
    MatchRow {
        id,
        title: format!("match {}", id),
        scheduled_at: at(hours),
        location: Some("Court 1".to_string()),
        created_by: None,
        restricted_users: Vec::new(),
        group_ids: Vec::new(),
        participants: Vec::new(),
    }
}

pub fn participant(match_id: Uuid, minutes: i64) -> ParticipantRow {
    let profile_id = Uuid::new_v4();
    ParticipantRow {
        id: Uuid::new_v4(),
        match_id,
        profile_id: Some(profile_id),
        display_name: None,
        created_at: at(0) + Duration::minutes(minutes),
        profile: Some(Profile {
            id: profile_id,
            display_name: Some(format!("player {}", minutes)),
            avatar_url: None,
            rank: Some("silver".to_string()),
        }),
    }
}

pub fn event_row(hours: i64, tags: &[&str], intention: Option<&str>) -> EventRow {
    EventRow {
        id: Uuid::new_v4(),
        title: format!("event at {}", hours),
        starts_at: at(hours),
        location: None,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        intention: intention.map(str::to_string),
    }
}

pub fn thought(parent: Option<Uuid>, target: ThoughtTarget, minutes: i64) -> ThoughtRecord {
    ThoughtRecord {
        id: Uuid::new_v4(),
        author_id: Uuid::new_v4(),
        parent_thought_id: parent,
        target,
        body: format!("thought at {}", minutes),
        created_at: at(0) + Duration::minutes(minutes),
    }
}

/// Yields until `condition` holds, failing the test after a generous timeout.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(StdDuration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

//=========================================================================================
// FakeStore
//=========================================================================================

#[derive(Default)]
pub struct FakeStore {
    pub events: Mutex<Vec<EventRow>>,
    pub enrollments: Mutex<HashMap<Uuid, u32>>,
    pub matches: Mutex<Vec<MatchRow>>,
    pub groups: Mutex<Vec<GroupRecord>>,
    pub thought_counts: Mutex<HashMap<(TargetKind, Uuid), u32>>,
    pub thoughts: Mutex<Vec<ThoughtRecord>>,
    pub profiles: Mutex<HashMap<Uuid, Profile>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    held_match_fetches: Mutex<VecDeque<oneshot::Receiver<()>>>,
    held_match_loads: Mutex<VecDeque<oneshot::Receiver<()>>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_match(&self, row: MatchRow) {
        let mut matches = self.matches.lock().unwrap();
        matches.retain(|m| m.id != row.id);
        matches.push(row);
    }

    pub fn remove_match(&self, id: Uuid) {
        self.matches.lock().unwrap().retain(|m| m.id != id);
    }

    pub fn set_thought_count(&self, kind: TargetKind, id: Uuid, count: u32) {
        self.thought_counts.lock().unwrap().insert((kind, id), count);
    }

    pub fn put_profile(&self, profile: Profile) {
        self.profiles.lock().unwrap().insert(profile.id, profile);
    }

    /// Makes every call to the named operation fail until cleared.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// The next `fetch_match` reads its row immediately but does not return
    /// until the sender fires (or is dropped).
    pub fn hold_next_match_fetch(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.held_match_fetches.lock().unwrap().push_back(rx);
        tx
    }

    /// Same as `hold_next_match_fetch`, for the next full `fetch_matches`.
    pub fn hold_next_match_load(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.held_match_loads.lock().unwrap().push_back(rx);
        tx
    }

    fn enter(&self, op: &'static str) -> PortResult<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        if self.failing.lock().unwrap().contains(op) {
            return Err(PortError::Unexpected(format!("{} unavailable", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn fetch_events(&self) -> PortResult<Vec<EventRow>> {
        self.enter("fetch_events")?;
        Ok(self.events.lock().unwrap().clone())
    }

    async fn fetch_enrollment_counts(&self, event_ids: &[Uuid]) -> PortResult<HashMap<Uuid, u32>> {
        self.enter("fetch_enrollment_counts")?;
        let counts = self.enrollments.lock().unwrap();
        Ok(event_ids
            .iter()
            .filter_map(|id| counts.get(id).map(|c| (*id, *c)))
            .collect())
    }

    async fn fetch_matches(&self) -> PortResult<Vec<MatchRow>> {
        self.enter("fetch_matches")?;
        let rows = self.matches.lock().unwrap().clone();
        let held = self.held_match_loads.lock().unwrap().pop_front();
        if let Some(release) = held {
            let _ = release.await;
        }
        Ok(rows)
    }

    async fn fetch_match(&self, match_id: Uuid) -> PortResult<MatchRow> {
        self.enter("fetch_match")?;
        let row = self
            .matches
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == match_id)
            .cloned();
        let held = self.held_match_fetches.lock().unwrap().pop_front();
        if let Some(release) = held {
            let _ = release.await;
        }
        row.ok_or_else(|| PortError::NotFound(format!("Match {} not found", match_id)))
    }

    async fn fetch_groups(&self, group_ids: &[Uuid]) -> PortResult<Vec<GroupRecord>> {
        self.enter("fetch_groups")?;
        Ok(self
            .groups
            .lock()
            .unwrap()
            .iter()
            .filter(|g| group_ids.contains(&g.id))
            .cloned()
            .collect())
    }

    async fn fetch_thought_counts(
        &self,
        kind: TargetKind,
        target_ids: &[Uuid],
    ) -> PortResult<HashMap<Uuid, u32>> {
        self.enter("fetch_thought_counts")?;
        let counts = self.thought_counts.lock().unwrap();
        Ok(target_ids
            .iter()
            .filter_map(|id| counts.get(&(kind, *id)).map(|c| (*id, *c)))
            .collect())
    }

    async fn fetch_thoughts(&self, target: ThoughtTarget) -> PortResult<Vec<ThoughtRecord>> {
        self.enter("fetch_thoughts")?;
        Ok(self
            .thoughts
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.target == target)
            .cloned()
            .collect())
    }

    async fn fetch_profile(&self, user_id: Uuid) -> PortResult<Profile> {
        self.enter("fetch_profile")?;
        self.profiles
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Profile {} not found", user_id)))
    }
}

//=========================================================================================
// FakeTransport
//=========================================================================================

/// A realtime transport whose channels are driven by the test.
#[derive(Default)]
pub struct FakeTransport {
    senders: Mutex<HashMap<String, UnboundedSender<ChannelMessage>>>,
    opens: Mutex<HashMap<String, usize>>,
    refuse: Mutex<bool>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_opens(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    pub fn opens(&self, name: &str) -> usize {
        self.opens.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Whether the latest channel opened under `name` still has a live receiver.
    pub fn is_open(&self, name: &str) -> bool {
        self.senders
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn push(&self, name: &str, message: ChannelMessage) -> bool {
        self.senders
            .lock()
            .unwrap()
            .get(name)
            .is_some_and(|tx| tx.unbounded_send(message).is_ok())
    }

    pub fn push_change(
        &self,
        name: &str,
        event_type: &str,
        table: &str,
        new: serde_json::Value,
        old: serde_json::Value,
    ) -> bool {
        self.push(
            name,
            ChannelMessage::Change(RawChange {
                event_type: event_type.to_string(),
                table: table.to_string(),
                new: Some(new),
                old: Some(old),
            }),
        )
    }

    pub fn fail_channel(&self, name: &str, reason: &str) -> bool {
        self.push(
            name,
            ChannelMessage::Status(ChannelStatus::ChannelError(reason.to_string())),
        )
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn open(&self, spec: &ChannelSpec) -> PortResult<ChannelStream> {
        *self.opens.lock().unwrap().entry(spec.name.clone()).or_default() += 1;
        if *self.refuse.lock().unwrap() {
            return Err(PortError::ChannelClosed(format!("{} refused", spec.name)));
        }
        let (tx, rx) = unbounded();
        let _ = tx.unbounded_send(ChannelMessage::Status(ChannelStatus::Subscribed));
        self.senders.lock().unwrap().insert(spec.name.clone(), tx);
        Ok(Box::pin(rx))
    }
}

//=========================================================================================
// MemoryPersistence
//=========================================================================================

#[derive(Default)]
pub struct MemoryPersistence {
    session: Mutex<Option<AuthSession>>,
}

impl MemoryPersistence {
    pub fn with_user(user_id: Uuid) -> Self {
        Self {
            session: Mutex::new(Some(AuthSession {
                user_id,
                expires_at: None,
            })),
        }
    }

    pub fn stored_user(&self) -> Option<Uuid> {
        self.session.lock().unwrap().as_ref().map(|s| s.user_id)
    }
}

impl SessionPersistence for MemoryPersistence {
    fn load(&self) -> PortResult<Option<AuthSession>> {
        Ok(self.session.lock().unwrap().clone())
    }

    fn save(&self, session: &AuthSession) -> PortResult<()> {
        *self.session.lock().unwrap() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> PortResult<()> {
        *self.session.lock().unwrap() = None;
        Ok(())
    }
}
