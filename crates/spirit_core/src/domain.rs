//! crates/spirit_core/src/domain.rs
//!
//! Defines the core data structures for the feed: identity, matches and their
//! participants, events, thoughts, and the typed change notifications that drive
//! reconciliation. Raw row shapes (`*Row`) mirror what a store query returns;
//! enriched records (`*Record`) are what the in-memory feed holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single row as delivered by a change notification: column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

//=========================================================================================
// Identity
//=========================================================================================

/// Public profile fields joined onto participants and held by the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub rank: Option<String>,
}

/// The current viewer as seen by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<Uuid>,
    pub profile: Option<Profile>,
}

/// The part of an auth token blob the client cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: Uuid,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Notifications emitted by the backend's auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    TokenRefreshed(AuthSession),
    /// May be spurious: a background refresh racing a foreground read emits it
    /// while the persisted token is still valid.
    SignedOut,
}

//=========================================================================================
// Matches
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// A participant row joined with its (optional) profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRow {
    pub id: Uuid,
    pub match_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: Uuid,
    pub match_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub rank: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ParticipantRow> for ParticipantRecord {
    fn from(row: ParticipantRow) -> Self {
        let (avatar_url, rank, profile_name) = match row.profile {
            Some(p) => (p.avatar_url, p.rank, p.display_name),
            None => (None, None, None),
        };
        Self {
            id: row.id,
            match_id: row.match_id,
            profile_id: row.profile_id,
            // Guests carry their own name; members fall back to the profile's.
            display_name: row.display_name.or(profile_name),
            avatar_url,
            rank,
            created_at: row.created_at,
        }
    }
}

/// The visibility rule: a match is visible iff its allow-list is empty or
/// names the viewer. An anonymous viewer sees only unrestricted matches.
pub fn is_visible(restricted_users: &[Uuid], viewer: Option<Uuid>) -> bool {
    if restricted_users.is_empty() {
        return true;
    }
    viewer.is_some_and(|id| restricted_users.contains(&id))
}

/// A match row with its participants nested, before counts and groups are joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRow {
    pub id: Uuid,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub location: Option<String>,
    pub created_by: Option<Uuid>,
    pub restricted_users: Vec<Uuid>,
    pub group_ids: Vec<Uuid>,
    pub participants: Vec<ParticipantRow>,
}

/// A match as held in the feed: participants ordered by `created_at`, with
/// derived thought count and group records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub title: String,
    pub scheduled_at: DateTime<Utc>,
    pub location: Option<String>,
    pub created_by: Option<Uuid>,
    pub restricted_users: Vec<Uuid>,
    pub participants: Vec<ParticipantRecord>,
    pub thoughts_count: u32,
    pub groups: Vec<GroupRecord>,
}

impl MatchRecord {
    pub fn is_visible_to(&self, viewer: Option<Uuid>) -> bool {
        is_visible(&self.restricted_users, viewer)
    }

    pub fn has_participant(&self, participant_id: Uuid) -> bool {
        self.participants.iter().any(|p| p.id == participant_id)
    }
}

//=========================================================================================
// Events
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub intention: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub intention: Option<String>,
    pub enrollments_count: u32,
    pub thoughts_count: u32,
}

/// Filter facets computed once per bootstrap load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedAggregates {
    pub tags: BTreeSet<String>,
    pub intentions: BTreeSet<String>,
}

//=========================================================================================
// Thoughts (comments)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Event,
    Match,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ThoughtTarget {
    Event(Uuid),
    Match(Uuid),
}

impl ThoughtTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            ThoughtTarget::Event(_) => TargetKind::Event,
            ThoughtTarget::Match(_) => TargetKind::Match,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ThoughtTarget::Event(id) | ThoughtTarget::Match(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub id: Uuid,
    pub author_id: Uuid,
    pub parent_thought_id: Option<Uuid>,
    pub target: ThoughtTarget,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtNode {
    pub thought: ThoughtRecord,
    pub replies: Vec<ThoughtNode>,
}

//=========================================================================================
// Change notifications
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(format!("unknown change kind '{}'", other)),
        }
    }
}

/// The named collections of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Events,
    Matches,
    MatchParticipants,
    Enrollments,
    Thoughts,
    Notifications,
    Messages,
    Conversations,
    ConversationParticipants,
    MessageReactions,
    Profiles,
    Groups,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Events => "events",
            Collection::Matches => "matches",
            Collection::MatchParticipants => "match_participants",
            Collection::Enrollments => "enrollments",
            Collection::Thoughts => "thoughts",
            Collection::Notifications => "notifications",
            Collection::Messages => "messages",
            Collection::Conversations => "conversations",
            Collection::ConversationParticipants => "conversation_participants",
            Collection::MessageReactions => "message_reactions",
            Collection::Profiles => "profiles",
            Collection::Groups => "groups",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let collection = match s {
            "events" => Collection::Events,
            "matches" => Collection::Matches,
            "match_participants" => Collection::MatchParticipants,
            "enrollments" => Collection::Enrollments,
            "thoughts" => Collection::Thoughts,
            "notifications" => Collection::Notifications,
            "messages" => Collection::Messages,
            "conversations" => Collection::Conversations,
            "conversation_participants" => Collection::ConversationParticipants,
            "message_reactions" => Collection::MessageReactions,
            "profiles" => Collection::Profiles,
            "groups" => Collection::Groups,
            other => return Err(format!("unknown collection '{}'", other)),
        };
        Ok(collection)
    }
}

/// A typed change notification, parsed at the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub old: Option<Row>,
    pub new: Option<Row>,
}

impl ChangeEvent {
    /// The most informative row carried: `new` for inserts/updates, `old` for deletes.
    pub fn row(&self) -> Option<&Row> {
        match self.kind {
            ChangeKind::Delete => self.old.as_ref().or(self.new.as_ref()),
            _ => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    /// Reads a uuid column from the carried row, if present and well-formed.
    pub fn uuid_field(&self, column: &str) -> Option<Uuid> {
        self.row()
            .and_then(|row| row.get(column))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

//=========================================================================================
// Realtime channel plumbing
//=========================================================================================

/// Optional server-side scope for a channel, e.g. `conversation_id = <id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub collection: Collection,
    pub filter: Option<ChannelFilter>,
}

impl ChannelSpec {
    /// One channel per collection, named after it.
    pub fn for_collection(collection: Collection) -> Self {
        Self {
            name: collection.as_str().to_string(),
            collection,
            filter: None,
        }
    }

    pub fn scoped(collection: Collection, column: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            name: format!("{}:{}={}", collection.as_str(), column, value),
            collection,
            filter: Some(ChannelFilter {
                column: column.to_string(),
                value,
            }),
        }
    }

    /// Whether a raw row passes this channel's filter.
    pub fn accepts(&self, row: Option<&serde_json::Value>) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        row.and_then(|r| r.get(&filter.column))
            .map(|v| match v {
                serde_json::Value::String(s) => s == &filter.value,
                other => other.to_string() == filter.value,
            })
            .unwrap_or(false)
    }
}

/// A change exactly as the transport delivers it, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(RawChange),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with(restricted: Vec<Uuid>) -> MatchRecord {
        MatchRecord {
            id: Uuid::new_v4(),
            title: "Sunday match".to_string(),
            scheduled_at: Utc::now(),
            location: None,
            created_by: None,
            restricted_users: restricted,
            participants: Vec::new(),
            thoughts_count: 0,
            groups: Vec::new(),
        }
    }

    #[test]
    fn unrestricted_match_is_visible_to_everyone() {
        let record = record_with(Vec::new());
        assert!(record.is_visible_to(None));
        assert!(record.is_visible_to(Some(Uuid::new_v4())));
    }

    #[test]
    fn restricted_match_is_visible_only_to_listed_viewers() {
        let allowed = Uuid::new_v4();
        let record = record_with(vec![allowed]);
        assert!(record.is_visible_to(Some(allowed)));
        assert!(!record.is_visible_to(Some(Uuid::new_v4())));
        assert!(!record.is_visible_to(None));
    }

    #[test]
    fn participant_falls_back_to_profile_name() {
        let profile_id = Uuid::new_v4();
        let row = ParticipantRow {
            id: Uuid::new_v4(),
            match_id: Uuid::new_v4(),
            profile_id: Some(profile_id),
            display_name: None,
            created_at: Utc::now(),
            profile: Some(Profile {
                id: profile_id,
                display_name: Some("Ama".to_string()),
                avatar_url: Some("https://cdn/a.png".to_string()),
                rank: Some("gold".to_string()),
            }),
        };
        let record = ParticipantRecord::from(row);
        assert_eq!(record.display_name.as_deref(), Some("Ama"));
        assert_eq!(record.rank.as_deref(), Some("gold"));
    }

    #[test]
    fn delete_events_read_the_old_row() {
        let id = Uuid::new_v4();
        let mut old = Row::new();
        old.insert("id".to_string(), json!(id.to_string()));
        let event = ChangeEvent {
            kind: ChangeKind::Delete,
            collection: Collection::Matches,
            old: Some(old),
            new: None,
        };
        assert_eq!(event.uuid_field("id"), Some(id));
        assert_eq!(event.uuid_field("match_id"), None);
    }

    #[test]
    fn scoped_channel_filters_rows() {
        let spec = ChannelSpec::scoped(Collection::Messages, "conversation_id", "c-1");
        assert_eq!(spec.name, "messages:conversation_id=c-1");
        assert!(spec.accepts(Some(&json!({"conversation_id": "c-1"}))));
        assert!(!spec.accepts(Some(&json!({"conversation_id": "c-2"}))));
        assert!(!spec.accepts(None));
        assert!(ChannelSpec::for_collection(Collection::Matches).accepts(None));
    }

    #[test]
    fn collection_names_round_trip() {
        for name in ["matches", "match_participants", "thoughts", "message_reactions"] {
            let collection: Collection = name.parse().unwrap();
            assert_eq!(collection.as_str(), name);
        }
        assert!("nope".parse::<Collection>().is_err());
        assert_eq!("insert".parse::<ChangeKind>(), Ok(ChangeKind::Insert));
    }
}
