//! crates/spirit_core/src/enrich.rs
//!
//! Turns raw joined rows into the enriched shape the feed holds. Both the
//! bootstrap load and single-record reconciliation go through here, so a match
//! looks the same no matter which path produced it.

use crate::domain::{GroupRecord, MatchRecord, MatchRow, ParticipantRecord, TargetKind};
use crate::ports::{PortResult, RemoteStore};
use std::collections::HashMap;
use uuid::Uuid;

/// Builds a `MatchRecord` from its row, thought count, and the known groups.
/// Participants come out sorted ascending by `created_at`.
pub fn enrich_match(
    row: MatchRow,
    thoughts_count: u32,
    groups: &HashMap<Uuid, GroupRecord>,
) -> MatchRecord {
    let mut participants: Vec<ParticipantRecord> =
        row.participants.into_iter().map(ParticipantRecord::from).collect();
    sort_participants(&mut participants);

    let groups = row
        .group_ids
        .iter()
        .filter_map(|id| groups.get(id).cloned())
        .collect();

    MatchRecord {
        id: row.id,
        title: row.title,
        scheduled_at: row.scheduled_at,
        location: row.location,
        created_by: row.created_by,
        restricted_users: row.restricted_users,
        participants,
        thoughts_count,
        groups,
    }
}

/// Fetches one match and everything it is enriched with. Any failing query
/// fails the whole fetch, so callers keep their previous copy.
pub async fn fetch_enriched_match(
    store: &dyn RemoteStore,
    match_id: Uuid,
) -> PortResult<MatchRecord> {
    let row = store.fetch_match(match_id).await?;

    let counts = store
        .fetch_thought_counts(TargetKind::Match, &[match_id])
        .await?;
    let thoughts_count = counts.get(&match_id).copied().unwrap_or(0);

    let groups = if row.group_ids.is_empty() {
        HashMap::new()
    } else {
        index_groups(store.fetch_groups(&row.group_ids).await?)
    };

    Ok(enrich_match(row, thoughts_count, &groups))
}

pub fn index_groups(groups: Vec<GroupRecord>) -> HashMap<Uuid, GroupRecord> {
    groups.into_iter().map(|g| (g.id, g)).collect()
}

/// Stable sort, so participants created in the same instant keep their order.
pub fn sort_participants(participants: &mut [ParticipantRecord]) {
    participants.sort_by_key(|p| p.created_at);
}

pub fn sort_by_schedule(matches: &mut [MatchRecord]) {
    matches.sort_by_key(|m| m.scheduled_at);
}
