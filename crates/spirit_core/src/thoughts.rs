//! crates/spirit_core/src/thoughts.rs
//!
//! Assembles flat thought (comment) rows into a forest of threads.

use crate::domain::{ThoughtNode, ThoughtRecord, ThoughtTarget};
use crate::ports::{PortResult, RemoteStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// What to do with a reply whose parent is not in the fetched set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Leave it out of the tree.
    #[default]
    Drop,
    /// Show it as a top-level thought.
    PromoteToRoot,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(OrphanPolicy::Drop),
            "promote" | "promote_to_root" => Ok(OrphanPolicy::PromoteToRoot),
            other => Err(format!("unknown orphan policy '{}'", other)),
        }
    }
}

/// Builds the thread forest. Roots and every reply list are ordered by
/// `created_at`; duplicate ids keep their first occurrence.
///
/// Replies whose parent chain loops back on itself never reach a root. They are
/// treated like orphans: dropped under `Drop`, and under `PromoteToRoot` each
/// loop is broken at its earliest thought, which becomes a root.
pub fn build_thought_forest(
    thoughts: Vec<ThoughtRecord>,
    policy: OrphanPolicy,
) -> Vec<ThoughtNode> {
    let mut thoughts = thoughts;
    thoughts.sort_by_key(|t| t.created_at);

    let mut seen = HashSet::new();
    thoughts.retain(|t| seen.insert(t.id));

    let mut roots = Vec::new();
    let mut children: HashMap<Uuid, Vec<ThoughtRecord>> = HashMap::new();
    for thought in thoughts {
        match thought.parent_thought_id {
            Some(parent) if parent != thought.id && seen.contains(&parent) => {
                children.entry(parent).or_default().push(thought);
            }
            Some(_) if policy == OrphanPolicy::Drop => {}
            _ => roots.push(thought),
        }
    }

    let mut forest: Vec<ThoughtNode> = roots
        .into_iter()
        .map(|root| attach_replies(root, &mut children))
        .collect();
    if policy == OrphanPolicy::PromoteToRoot {
        promote_loops(&mut forest, &mut children);
        forest.sort_by_key(|node| node.thought.created_at);
    }
    forest
}

fn attach_replies(
    thought: ThoughtRecord,
    children: &mut HashMap<Uuid, Vec<ThoughtRecord>>,
) -> ThoughtNode {
    let replies = children
        .remove(&thought.id)
        .unwrap_or_default()
        .into_iter()
        .map(|reply| attach_replies(reply, children))
        .collect();
    ThoughtNode { thought, replies }
}

/// Everything still in `children` after attaching the roots hangs off a loop.
/// Promotes the earliest thought of one loop per pass until none are left.
fn promote_loops(forest: &mut Vec<ThoughtNode>, children: &mut HashMap<Uuid, Vec<ThoughtRecord>>) {
    loop {
        let parent_of: HashMap<Uuid, (Uuid, DateTime<Utc>)> = children
            .iter()
            .flat_map(|(parent, replies)| {
                replies.iter().map(move |r| (r.id, (*parent, r.created_at)))
            })
            .collect();
        let Some(&start) = parent_of.keys().next() else {
            return;
        };

        // Walk up until an id repeats; the path from that id on is the loop.
        let mut path = vec![start];
        let mut at = start;
        let looped = loop {
            let Some(&(parent, _)) = parent_of.get(&at) else {
                break vec![at];
            };
            if let Some(i) = path.iter().position(|id| *id == parent) {
                break path.split_off(i);
            }
            if !parent_of.contains_key(&parent) {
                break vec![at];
            }
            path.push(parent);
            at = parent;
        };

        let Some(pick) = looped
            .into_iter()
            .min_by_key(|id| parent_of.get(id).map(|(_, created_at)| *created_at))
        else {
            return;
        };
        let Some((parent, _)) = parent_of.get(&pick) else {
            return;
        };
        let Some(siblings) = children.get_mut(parent) else {
            return;
        };
        let Some(index) = siblings.iter().position(|r| r.id == pick) else {
            return;
        };
        let record = siblings.remove(index);
        forest.push(attach_replies(record, children));
    }
}

/// Fetches the thoughts on one event or match and assembles them.
pub async fn load_thought_forest(
    store: &dyn RemoteStore,
    target: ThoughtTarget,
    policy: OrphanPolicy,
) -> PortResult<Vec<ThoughtNode>> {
    let thoughts = store.fetch_thoughts(target).await?;
    Ok(build_thought_forest(thoughts, policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{thought, FakeStore};

    fn forest_size(forest: &[ThoughtNode]) -> usize {
        forest.iter().map(|n| 1 + forest_size(&n.replies)).sum()
    }

    fn collect_ids(forest: &[ThoughtNode], out: &mut Vec<Uuid>) {
        for node in forest {
            out.push(node.thought.id);
            collect_ids(&node.replies, out);
        }
    }

    #[test]
    fn test_replies_nest_under_parents_in_order() {
        let target = ThoughtTarget::Event(Uuid::new_v4());
        let root = thought(None, target, 0);
        let late = thought(Some(root.id), target, 20);
        let early = thought(Some(root.id), target, 10);
        let nested = thought(Some(early.id), target, 30);
        let second_root = thought(None, target, 5);

        let forest = build_thought_forest(
            vec![nested.clone(), late.clone(), second_root.clone(), root.clone(), early.clone()],
            OrphanPolicy::Drop,
        );

        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].thought.id, root.id);
        assert_eq!(forest[1].thought.id, second_root.id);
        let replies: Vec<_> = forest[0].replies.iter().map(|n| n.thought.id).collect();
        assert_eq!(replies, vec![early.id, late.id]);
        assert_eq!(forest[0].replies[0].replies[0].thought.id, nested.id);
    }

    #[test]
    fn test_every_thought_appears_once_when_promoting() {
        let target = ThoughtTarget::Match(Uuid::new_v4());
        let root = thought(None, target, 0);
        let reply = thought(Some(root.id), target, 1);
        let orphan = thought(Some(Uuid::new_v4()), target, 2);
        let orphan_reply = thought(Some(orphan.id), target, 3);
        let input = vec![root.clone(), reply.clone(), orphan.clone(), orphan_reply.clone()];

        let forest = build_thought_forest(input.clone(), OrphanPolicy::PromoteToRoot);

        let mut ids = Vec::new();
        collect_ids(&forest, &mut ids);
        ids.sort();
        let mut expected: Vec<_> = input.iter().map(|t| t.id).collect();
        expected.sort();
        assert_eq!(ids, expected);
        let roots: Vec<_> = forest.iter().map(|n| n.thought.id).collect();
        assert_eq!(roots, vec![root.id, orphan.id]);
    }

    #[test]
    fn test_orphans_and_their_replies_are_dropped() {
        let target = ThoughtTarget::Event(Uuid::new_v4());
        let root = thought(None, target, 0);
        let orphan = thought(Some(Uuid::new_v4()), target, 1);
        let orphan_reply = thought(Some(orphan.id), target, 2);

        let input = vec![root.clone(), orphan, orphan_reply];
        let forest = build_thought_forest(input, OrphanPolicy::Drop);

        assert_eq!(forest.len(), 1);
        assert_eq!(forest_size(&forest), 1);
        assert_eq!(forest[0].thought.id, root.id);
    }

    #[test]
    fn test_duplicates_and_self_parents() {
        let target = ThoughtTarget::Event(Uuid::new_v4());
        let root = thought(None, target, 0);
        let mut looped = thought(None, target, 1);
        looped.parent_thought_id = Some(looped.id);

        let input = vec![root.clone(), root.clone(), looped.clone()];
        let forest = build_thought_forest(input, OrphanPolicy::PromoteToRoot);
        assert_eq!(forest_size(&forest), 2);

        let dropped = build_thought_forest(vec![root, looped], OrphanPolicy::Drop);
        assert_eq!(forest_size(&dropped), 1);
    }

    #[test]
    fn test_reply_loops_follow_the_orphan_policy() {
        let target = ThoughtTarget::Match(Uuid::new_v4());
        let root = thought(None, target, 0);
        let mut a = thought(None, target, 1);
        let mut b = thought(None, target, 2);
        a.parent_thought_id = Some(b.id);
        b.parent_thought_id = Some(a.id);
        let tail = thought(Some(b.id), target, 3);
        let input = vec![tail.clone(), b.clone(), root.clone(), a.clone()];

        let forest = build_thought_forest(input.clone(), OrphanPolicy::PromoteToRoot);
        let mut ids = Vec::new();
        collect_ids(&forest, &mut ids);
        ids.sort();
        let mut expected: Vec<_> = input.iter().map(|t| t.id).collect();
        expected.sort();
        assert_eq!(ids, expected);

        // The loop is broken at its earliest thought.
        let roots: Vec<_> = forest.iter().map(|n| n.thought.id).collect();
        assert_eq!(roots, vec![root.id, a.id]);
        assert_eq!(forest[1].replies[0].thought.id, b.id);
        assert_eq!(forest[1].replies[0].replies[0].thought.id, tail.id);

        let dropped = build_thought_forest(input, OrphanPolicy::Drop);
        assert_eq!(forest_size(&dropped), 1);
        assert_eq!(dropped[0].thought.id, root.id);
    }

    #[test]
    fn test_policy_parses() {
        assert_eq!("drop".parse::<OrphanPolicy>(), Ok(OrphanPolicy::Drop));
        assert_eq!("PROMOTE".parse::<OrphanPolicy>(), Ok(OrphanPolicy::PromoteToRoot));
        assert!("keep".parse::<OrphanPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_load_filters_by_target() {
        let store = FakeStore::new();
        let event = ThoughtTarget::Event(Uuid::new_v4());
        let other = ThoughtTarget::Match(Uuid::new_v4());
        let root = thought(None, event, 0);
        store.thoughts.lock().unwrap().extend([
            root.clone(),
            thought(Some(root.id), event, 1),
            thought(None, other, 2),
        ]);

        let forest = load_thought_forest(&store, event, OrphanPolicy::Drop).await.unwrap();
        assert_eq!(forest.len(), 1);
        assert_eq!(forest_size(&forest), 2);
    }
}
