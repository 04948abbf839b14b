//! services/sync/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `RemoteStore` port from the core crate. It reads the backend's Postgres
//! tables directly using `sqlx`.
//!
//! The schema belongs to the hosted backend, so this adapter runs no migrations
//! and only ever reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spirit_core::domain::{
    EventRow, GroupRecord, MatchRow, ParticipantRow, Profile, TargetKind, ThoughtRecord,
    ThoughtTarget,
};
use spirit_core::ports::{PortError, PortResult, RemoteStore};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `RemoteStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Loads participants (with their profiles) for the given matches, grouped
    /// by match id.
    async fn participants_for(
        &self,
        match_ids: &[Uuid],
    ) -> PortResult<HashMap<Uuid, Vec<ParticipantRow>>> {
        let records = sqlx::query_as::<_, ParticipantRecord>(
            "SELECT mp.id, mp.match_id, mp.profile_id, mp.display_name, mp.created_at,
                    p.display_name AS profile_display_name, p.avatar_url AS profile_avatar_url,
                    p.rank AS profile_rank
             FROM match_participants mp
             LEFT JOIN profiles p ON p.id = mp.profile_id
             WHERE mp.match_id = ANY($1)",
        )
        .bind(match_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let mut grouped: HashMap<Uuid, Vec<ParticipantRow>> = HashMap::new();
        for record in records {
            grouped.entry(record.match_id).or_default().push(record.to_domain());
        }
        Ok(grouped)
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Postgres `count(*)` is a bigint; the feed counts in `u32`.
fn to_count(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct EventRecord {
    id: Uuid,
    title: String,
    starts_at: DateTime<Utc>,
    location: Option<String>,
    tags: Option<Vec<String>>,
    intention: Option<String>,
}
impl EventRecord {
    fn to_domain(self) -> EventRow {
        EventRow {
            id: self.id,
            title: self.title,
            starts_at: self.starts_at,
            location: self.location,
            tags: self.tags.unwrap_or_default(),
            intention: self.intention,
        }
    }
}

#[derive(FromRow)]
struct MatchDbRecord {
    id: Uuid,
    title: String,
    scheduled_at: DateTime<Utc>,
    location: Option<String>,
    created_by: Option<Uuid>,
    restricted_users: Option<Vec<Uuid>>,
    group_ids: Option<Vec<Uuid>>,
}
impl MatchDbRecord {
    fn to_domain(self, participants: Vec<ParticipantRow>) -> MatchRow {
        MatchRow {
            id: self.id,
            title: self.title,
            scheduled_at: self.scheduled_at,
            location: self.location,
            created_by: self.created_by,
            restricted_users: self.restricted_users.unwrap_or_default(),
            group_ids: self.group_ids.unwrap_or_default(),
            participants,
        }
    }
}

#[derive(FromRow)]
struct ParticipantRecord {
    id: Uuid,
    match_id: Uuid,
    profile_id: Option<Uuid>,
    display_name: Option<String>,
    created_at: DateTime<Utc>,
    profile_display_name: Option<String>,
    profile_avatar_url: Option<String>,
    profile_rank: Option<String>,
}
impl ParticipantRecord {
    fn to_domain(self) -> ParticipantRow {
        // Guests have no profile row; the join leaves every profile column null.
        let profile = self.profile_id.map(|id| Profile {
            id,
            display_name: self.profile_display_name,
            avatar_url: self.profile_avatar_url,
            rank: self.profile_rank,
        });
        ParticipantRow {
            id: self.id,
            match_id: self.match_id,
            profile_id: self.profile_id,
            display_name: self.display_name,
            created_at: self.created_at,
            profile,
        }
    }
}

#[derive(FromRow)]
struct GroupDbRecord {
    id: Uuid,
    name: String,
    avatar_url: Option<String>,
}
impl GroupDbRecord {
    fn to_domain(self) -> GroupRecord {
        GroupRecord {
            id: self.id,
            name: self.name,
            avatar_url: self.avatar_url,
        }
    }
}

#[derive(FromRow)]
struct CountRecord {
    target_id: Uuid,
    total: i64,
}

#[derive(FromRow)]
struct ThoughtDbRecord {
    id: Uuid,
    author_id: Uuid,
    parent_thought_id: Option<Uuid>,
    body: String,
    created_at: DateTime<Utc>,
}
impl ThoughtDbRecord {
    fn to_domain(self, target: ThoughtTarget) -> ThoughtRecord {
        ThoughtRecord {
            id: self.id,
            author_id: self.author_id,
            parent_thought_id: self.parent_thought_id,
            target,
            body: self.body,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct ProfileRecord {
    id: Uuid,
    display_name: Option<String>,
    avatar_url: Option<String>,
    rank: Option<String>,
}
impl ProfileRecord {
    fn to_domain(self) -> Profile {
        Profile {
            id: self.id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            rank: self.rank,
        }
    }
}

const MATCH_COLUMNS: &str =
    "id, title, scheduled_at, location, created_by, restricted_users, group_ids";

/// The column on `thoughts` that points at each kind of target.
fn target_column(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Event => "event_id",
        TargetKind::Match => "match_id",
    }
}

//=========================================================================================
// `RemoteStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl RemoteStore for DbAdapter {
    async fn fetch_events(&self) -> PortResult<Vec<EventRow>> {
        let records = sqlx::query_as::<_, EventRecord>(
            "SELECT id, title, starts_at, location, tags, intention FROM events ORDER BY starts_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(EventRecord::to_domain).collect())
    }

    async fn fetch_enrollment_counts(&self, event_ids: &[Uuid]) -> PortResult<HashMap<Uuid, u32>> {
        let records = sqlx::query_as::<_, CountRecord>(
            "SELECT event_id AS target_id, count(*) AS total
             FROM enrollments WHERE event_id = ANY($1) GROUP BY event_id",
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records
            .into_iter()
            .map(|r| (r.target_id, to_count(r.total)))
            .collect())
    }

    async fn fetch_matches(&self) -> PortResult<Vec<MatchRow>> {
        let records = sqlx::query_as::<_, MatchDbRecord>(&format!(
            "SELECT {} FROM matches ORDER BY scheduled_at",
            MATCH_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut participants = self.participants_for(&ids).await?;
        Ok(records
            .into_iter()
            .map(|r| {
                let joined = participants.remove(&r.id).unwrap_or_default();
                r.to_domain(joined)
            })
            .collect())
    }

    async fn fetch_match(&self, match_id: Uuid) -> PortResult<MatchRow> {
        let record = sqlx::query_as::<_, MatchDbRecord>(&format!(
            "SELECT {} FROM matches WHERE id = $1",
            MATCH_COLUMNS
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound(format!("Match with id {} not found", match_id)))?;

        let participants = self
            .participants_for(&[match_id])
            .await?
            .remove(&match_id)
            .unwrap_or_default();
        Ok(record.to_domain(participants))
    }

    async fn fetch_groups(&self, group_ids: &[Uuid]) -> PortResult<Vec<GroupRecord>> {
        let records = sqlx::query_as::<_, GroupDbRecord>(
            "SELECT id, name, avatar_url FROM groups WHERE id = ANY($1)",
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(GroupDbRecord::to_domain).collect())
    }

    async fn fetch_thought_counts(
        &self,
        kind: TargetKind,
        target_ids: &[Uuid],
    ) -> PortResult<HashMap<Uuid, u32>> {
        let column = target_column(kind);
        let records = sqlx::query_as::<_, CountRecord>(&format!(
            "SELECT {col} AS target_id, count(*) AS total
             FROM thoughts WHERE {col} = ANY($1) GROUP BY {col}",
            col = column
        ))
        .bind(target_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records
            .into_iter()
            .map(|r| (r.target_id, to_count(r.total)))
            .collect())
    }

    async fn fetch_thoughts(&self, target: ThoughtTarget) -> PortResult<Vec<ThoughtRecord>> {
        let records = sqlx::query_as::<_, ThoughtDbRecord>(&format!(
            "SELECT id, author_id, parent_thought_id, body, created_at
             FROM thoughts WHERE {} = $1 ORDER BY created_at",
            target_column(target.kind())
        ))
        .bind(target.id())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(records.into_iter().map(|r| r.to_domain(target)).collect())
    }

    async fn fetch_profile(&self, user_id: Uuid) -> PortResult<Profile> {
        sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, display_name, avatar_url, rank FROM profiles WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .map(ProfileRecord::to_domain)
        .ok_or_else(|| PortError::NotFound(format!("Profile with id {} not found", user_id)))
    }
}
