//! Last-known presence per remote peer, aged by local receipt time.
//!
//! Records are overwritten on every heartbeat (last writer wins). Expiry uses
//! only the local `last_seen` instant; the sender's wall clock is never
//! compared against ours.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use vibespace_core::{PeerId, PresenceRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Unknown,
    Present,
    Stale,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    entries: HashMap<PeerId, PresenceEntry>,
    stale_after: Duration,
}

impl PresenceTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            stale_after,
        }
    }

    /// Store `record`. Returns `true` when the visible state changed (new peer
    /// or a field other than the send timestamp differs).
    pub fn observe(&mut self, record: PresenceRecord, now: Instant) -> bool {
        match self.entries.get_mut(&record.peer_id) {
            Some(entry) => {
                let changed = !same_state(&entry.record, &record);
                entry.last_seen = entry.last_seen.max(now);
                entry.record = record;
                changed
            }
            None => {
                self.entries.insert(
                    record.peer_id.clone(),
                    PresenceEntry {
                        record,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, peer: &str) -> Option<PresenceRecord> {
        self.entries.remove(peer).map(|entry| entry.record)
    }

    pub fn status(&self, peer: &str, now: Instant) -> PresenceStatus {
        match self.entries.get(peer) {
            None => PresenceStatus::Unknown,
            Some(entry) if self.is_stale(entry, now) => PresenceStatus::Stale,
            Some(_) => PresenceStatus::Present,
        }
    }

    /// Drop every record older than the threshold; returns their ids sorted.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let mut expired = self
            .entries
            .keys()
            .filter(|peer| self.status(peer, now) == PresenceStatus::Stale)
            .cloned()
            .collect::<Vec<_>>();
        for peer in &expired {
            self.entries.remove(peer);
        }
        expired.sort();
        expired
    }

    pub fn get(&self, peer: &str) -> Option<&PresenceRecord> {
        self.entries.get(peer).map(|entry| &entry.record)
    }

    pub fn last_seen(&self, peer: &str) -> Option<Instant> {
        self.entries.get(peer).map(|entry| entry.last_seen)
    }

    /// Peers currently reporting `channel_id` as their active channel.
    pub fn peers_in_channel(&self, channel_id: &str) -> Vec<PeerId> {
        let mut peers = self
            .entries
            .values()
            .filter(|entry| entry.record.channel_id.as_deref() == Some(channel_id))
            .map(|entry| entry.record.peer_id.clone())
            .collect::<Vec<_>>();
        peers.sort();
        peers
    }

    /// All records, ordered by peer id.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records = self
            .entries
            .values()
            .map(|entry| entry.record.clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_stale(&self, entry: &PresenceEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) > self.stale_after
    }
}

fn same_state(a: &PresenceRecord, b: &PresenceRecord) -> bool {
    a.display_name == b.display_name
        && a.avatar == b.avatar
        && a.channel_id == b.channel_id
        && a.muted == b.muted
        && a.speaking == b.speaking
        && a.camera_on == b.camera_on
}
