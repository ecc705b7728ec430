//! Presence Registry
//!
//! Maps self-declared identities to their last-activity instant and
//! the set of connections they own. One identity may hold several
//! connections at once (multiple tabs).
//!
//! Offline detection is delete-on-timeout, not delete-on-empty: an
//! entry whose connection set empties is kept until its last activity
//! ages past the expiry window, so a quick reconnect (page refresh)
//! does not flap presence. Only the periodic reconciler deletes
//! entries, via `expire_stale`.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::gateway::ConnId;

#[derive(Debug)]
struct PresenceEntry {
    last_activity: Instant,
    connections: HashSet<ConnId>,
    /// Whether an online event has been broadcast for this identity.
    /// Guards exactly-once online/offline transitions.
    announced: bool,
}

impl PresenceEntry {
    fn new() -> Self {
        Self {
            last_activity: Instant::now(),
            connections: HashSet::new(),
            announced: false,
        }
    }
}

/// Internally-synchronized presence store.
///
/// All mutation funnels through this contract; no caller iterates the
/// map except the reconciler through `expire_stale`.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Refresh an identity's activity, creating the entry if absent.
    /// Touching an unknown identity is a create, never an error.
    pub fn touch(&self, identity: &str) {
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(PresenceEntry::new);
        entry.last_activity = Instant::now();
    }

    /// Attach a connection to an identity, creating the entry if
    /// needed. Returns true when this identity should be announced
    /// online (first connection, not yet announced).
    pub fn bind(&self, identity: &str, conn: ConnId) -> bool {
        let mut entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(PresenceEntry::new);
        entry.connections.insert(conn);
        entry.last_activity = Instant::now();
        if entry.announced {
            false
        } else {
            entry.announced = true;
            true
        }
    }

    /// Detach a connection. When the set empties, last-activity is
    /// refreshed so the grace period starts at disconnect time. No
    /// offline event fires here; expiry is the reconciler's call.
    pub fn unbind(&self, identity: &str, conn: ConnId) {
        if let Some(mut entry) = self.entries.get_mut(identity) {
            entry.connections.remove(&conn);
            if entry.connections.is_empty() {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Identities currently considered online, including those inside
    /// their disconnect grace period.
    pub fn snapshot(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.announced)
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }

    /// Delete entries with no connections whose last activity exceeds
    /// the expiry window. Returns the identities to announce offline,
    /// each exactly once (the entry is gone afterwards). Entries that
    /// were never announced online expire silently.
    pub fn expire_stale(&self, window: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut offline = Vec::new();
        self.entries.retain(|identity, entry| {
            let stale = entry.connections.is_empty()
                && now.duration_since(entry.last_activity) > window;
            if stale && entry.announced {
                offline.push(identity.clone());
            }
            !stale
        });
        offline.sort();
        offline
    }

    /// Number of tracked identities (online plus in-grace).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
