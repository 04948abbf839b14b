//! crates/spirit_core/src/suppression.rs
//!
//! A short-lived set of recently deleted ids. Cascade deletes of children can
//! arrive after their parent is already gone; while a parent id sits in this set,
//! child notifications must not trigger a refetch that would bring it back.
//! Process-local and never authoritative.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct RecentlyDeleted {
    window: Duration,
    expiries: HashMap<Uuid, Instant>,
}

impl RecentlyDeleted {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expiries: HashMap::new(),
        }
    }

    /// Suppresses `id` for one window from now. Re-marking extends the window.
    pub fn mark(&mut self, id: Uuid) {
        self.purge_expired();
        self.expiries.insert(id, Instant::now() + self.window);
    }

    pub fn contains(&mut self, id: Uuid) -> bool {
        self.purge_expired();
        self.expiries.contains_key(&id)
    }

    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.expiries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.expiries.retain(|_, expiry| *expiry > now);
    }
}

impl Default for RecentlyDeleted {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPRESSION_WINDOW)
    }
}
