//! Ephemeral per-document presence: cursors, selections, user labels.
//!
//! Entries are last-writer-wins per client id, ordered by a client-owned clock.
//! Nothing here is persisted or merged into the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One client's presence as carried on the wire. `state: None` removes the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    #[serde(default)]
    pub state: Option<Value>,
}

/// Batch of presence entries, the payload of an awareness frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AwarenessUpdate {
    pub clients: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of plain JSON values cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone)]
struct ClientPresence {
    clock: u32,
    state: Option<Value>,
    last_seen: Instant,
}

#[derive(Debug, Default)]
pub struct AwarenessStore {
    clients: HashMap<u64, ClientPresence>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a single client's state. Returns what changed, or `None` when the
    /// entry was older than what we already hold.
    pub fn apply_entry(&mut self, client_id: u64, clock: u32, state: Option<Value>, now: Instant) -> Option<PresenceChange> {
        let current = self.clients.get(&client_id).map(|p| (p.clock, p.state.is_some()));
        if let Some((current_clock, had_state)) = current {
            let newer = clock > current_clock;
            let same_clock_removal = clock == current_clock && state.is_none() && had_state;
            if !newer && !same_clock_removal {
                return None;
            }
        }
        if current.is_none() && state.is_none() {
            // Removal of a client we never saw: nothing to remember.
            return None;
        }
        let had_state = matches!(current, Some((_, true)));

        let change = match (had_state, state.is_some()) {
            (false, true) => Some(PresenceChange::Added),
            (true, true) => Some(PresenceChange::Updated),
            (true, false) => Some(PresenceChange::Removed),
            // Newer removal of an already removed client: keep the higher clock.
            (false, false) => None,
        };

        self.clients.insert(client_id, ClientPresence { clock, state, last_seen: now });
        change
    }

    /// Merge a decoded update. The returned update holds only the entries that
    /// were accepted, which is what peers need to see.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> (AwarenessUpdate, Vec<(u64, PresenceChange)>) {
        let mut applied = AwarenessUpdate::default();
        let mut changes = Vec::new();
        for entry in &update.clients {
            if let Some(change) = self.apply_entry(entry.client_id, entry.clock, entry.state.clone(), now) {
                applied.clients.push(entry.clone());
                changes.push((entry.client_id, change));
            }
        }
        (applied, changes)
    }

    /// Drop the given clients, bumping their clocks so older states cannot come back.
    pub fn remove_clients<I>(&mut self, client_ids: I, now: Instant) -> AwarenessUpdate
    where
        I: IntoIterator<Item = u64>,
    {
        let mut removed = AwarenessUpdate::default();
        for client_id in client_ids {
            if let Some(presence) = self.clients.get_mut(&client_id) {
                if presence.state.is_none() {
                    continue;
                }
                presence.clock = presence.clock.saturating_add(1);
                presence.state = None;
                presence.last_seen = now;
                removed.clients.push(AwarenessEntry { client_id, clock: presence.clock, state: None });
            }
        }
        removed
    }

    /// Remove clients whose state was not refreshed within `timeout`, and forget
    /// tombstones that have been idle for as long.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> AwarenessUpdate {
        self.clients
            .retain(|_, p| p.state.is_some() || now.saturating_duration_since(p.last_seen) < timeout);
        let stale: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove_clients(stale, now)
    }

    /// Entries held, tombstones included.
    pub fn tracked(&self) -> usize {
        self.clients.len()
    }

    /// Every live client, suitable for bringing a new connection up to date.
    pub fn states(&self) -> AwarenessUpdate {
        let mut clients: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .filter_map(|(id, p)| {
                p.state.as_ref().map(|state| AwarenessEntry {
                    client_id: *id,
                    clock: p.clock,
                    state: Some(state.clone()),
                })
            })
            .collect();
        clients.sort_by_key(|e| e.client_id);
        AwarenessUpdate { clients }
    }

    pub fn get_state(&self, client_id: u64) -> Option<&Value> {
        self.clients.get(&client_id).and_then(|p| p.state.as_ref())
    }

    pub fn clock(&self, client_id: u64) -> Option<u32> {
        self.clients.get(&client_id).map(|p| p.clock)
    }

    /// Number of clients with a live state.
    pub fn len(&self) -> usize {
        self.clients.values().filter(|p| p.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(client_id: u64, clock: u32, state: Option<Value>) -> AwarenessUpdate {
        AwarenessUpdate { clients: vec![AwarenessEntry { client_id, clock, state }] }
    }

    #[test]
    fn later_clock_wins_in_order() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(1, 1, Some(json!({"cursor": 3, "user": "u1"}))), now);
        store.apply_update(&entry(1, 2, Some(json!({"cursor": 9}))), now);

        assert_eq!(store.get_state(1), Some(&json!({"cursor": 9})));
        assert_eq!(store.clock(1), Some(2));
    }

    #[test]
    fn earlier_clock_arriving_late_is_ignored() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(1, 2, Some(json!({"cursor": 9}))), now);
        let (applied, changes) = store.apply_update(&entry(1, 1, Some(json!({"cursor": 3}))), now);

        assert!(applied.is_empty());
        assert!(changes.is_empty());
        assert_eq!(store.get_state(1), Some(&json!({"cursor": 9})));
    }

    #[test]
    fn clients_are_independent() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(1, 5, Some(json!("a"))), now);
        store.apply_update(&entry(2, 1, Some(json!("b"))), now);

        assert_eq!(store.get_state(1), Some(&json!("a")));
        assert_eq!(store.get_state(2), Some(&json!("b")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn same_clock_null_removes() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(1, 3, Some(json!("a"))), now);
        let (_, changes) = store.apply_update(&entry(1, 3, None), now);

        assert_eq!(changes, vec![(1, PresenceChange::Removed)]);
        assert!(store.get_state(1).is_none());
        // The tombstone keeps stale states out.
        let (applied, _) = store.apply_update(&entry(1, 2, Some(json!("old"))), now);
        assert!(applied.is_empty());
    }

    #[test]
    fn removal_bumps_clock() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(7, 4, Some(json!("a"))), now);

        let removed = store.remove_clients([7, 8], now);
        assert_eq!(removed, entry(7, 5, None));
        assert!(store.is_empty());
        assert!(store.remove_clients([7], now).is_empty());
    }

    #[test]
    fn outdated_entries_expire() {
        let mut store = AwarenessStore::new();
        let start = Instant::now();
        store.apply_update(&entry(1, 1, Some(json!("stale"))), start);
        store.apply_update(&entry(2, 1, Some(json!("fresh"))), start + Duration::from_secs(20));

        let removed = store.remove_outdated(start + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(removed.clients.len(), 1);
        assert_eq!(removed.clients[0].client_id, 1);
        assert_eq!(store.states(), entry(2, 1, Some(json!("fresh"))));
    }

    #[test]
    fn removal_of_unknown_client_is_not_stored() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        let flood = AwarenessUpdate {
            clients: (0..1_000).map(|id| AwarenessEntry { client_id: id, clock: 0, state: None }).collect(),
        };

        let (applied, changes) = store.apply_update(&flood, now);
        assert!(applied.is_empty());
        assert!(changes.is_empty());
        assert_eq!(store.tracked(), 0);
    }

    #[test]
    fn idle_tombstones_are_forgotten() {
        let mut store = AwarenessStore::new();
        let start = Instant::now();
        store.apply_update(&entry(1, 1, Some(json!("a"))), start);
        store.remove_clients([1], start);
        assert_eq!(store.tracked(), 1);

        let removed = store.remove_outdated(start + Duration::from_secs(10), Duration::from_secs(30));
        assert!(removed.is_empty());
        assert_eq!(store.tracked(), 1);

        let removed = store.remove_outdated(start + Duration::from_secs(3600), Duration::from_secs(30));
        assert!(removed.is_empty());
        assert_eq!(store.tracked(), 0);
    }

    #[test]
    fn removal_at_max_clock_does_not_wrap() {
        let mut store = AwarenessStore::new();
        let now = Instant::now();
        store.apply_update(&entry(3, u32::MAX, Some(json!("a"))), now);

        let removed = store.remove_clients([3], now);
        assert_eq!(removed, entry(3, u32::MAX, None));
        let (applied, changes) = store.apply_update(&entry(3, 1, Some(json!("old"))), now);
        assert!(applied.is_empty());
        assert!(changes.is_empty());
        assert!(store.get_state(3).is_none());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let update = AwarenessUpdate::decode(br#"{"clients":[{"clientId":4,"clock":1,"state":null}]}"#).unwrap();
        assert_eq!(update, entry(4, 1, None));
        assert!(AwarenessUpdate::decode(b"not json").is_err());
    }
}
