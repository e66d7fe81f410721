//! Session command history: the append-only log of session-scoped statements
//! and their accepted responses. New or re-acquired backends replay the log
//! in order; each replayed reply must match the response the client already
//! saw, otherwise the backend has diverged and is torn down.

use crate::config::{HistoryConfig, HistoryPrunePolicy};
use crate::session::BackendId;
use hashbrown::HashMap;
use std::collections::VecDeque;
use tracing::info;

/// Ids skip 0 and the reserved top value, and wrap.
const ID_MIN: u32 = 1;
const ID_MAX: u32 = u32::MAX - 1;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u32,
    pub packet: Vec<u8>,
}

/// Outcome of delivering one backend's reply for a session command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// First reply to complete: it is what the client sees.
    Accepted,
    /// A later reply that matches the accepted one.
    Match,
    /// A later reply that diverges; the backend must be closed.
    Mismatch,
}

#[derive(Debug)]
pub struct SessionHistory {
    config: HistoryConfig,
    entries: VecDeque<HistoryEntry>,
    /// Accepted `is_ok` per id. Survives pruning of the entry list so late
    /// replies can still be verified.
    responses: HashMap<u32, bool>,
    /// Lowest id each live backend must still be able to observe.
    positions: HashMap<BackendId, u32>,
    next_id: u32,
}

impl SessionHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
            responses: HashMap::new(),
            positions: HashMap::new(),
            next_id: ID_MIN,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assign the next internal id, skipping 0 and the reserved top value.
    pub fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = if self.next_id >= ID_MAX {
            ID_MIN
        } else {
            self.next_id + 1
        };
        id
    }

    /// Append a session command that was routed to all backends.
    pub fn record(&mut self, id: u32, packet: Vec<u8>) {
        self.entries.push_back(HistoryEntry { id, packet });
    }

    /// Deliver one backend's reply for the command `id`. The first reply is
    /// accepted as the canonical response; later replies only verify.
    pub fn deliver_response(&mut self, id: u32, is_ok: bool) -> ResponseOutcome {
        match self.responses.get(&id) {
            None => {
                self.responses.insert(id, is_ok);
                ResponseOutcome::Accepted
            }
            Some(accepted) if *accepted == is_ok => ResponseOutcome::Match,
            Some(_) => ResponseOutcome::Mismatch,
        }
    }

    /// The accepted response for `id`, if one was delivered.
    pub fn response(&self, id: u32) -> Option<bool> {
        self.responses.get(&id).copied()
    }

    /// Pin a backend to the start of the history: everything from the oldest
    /// entry on must stay replayable for it.
    pub fn pin(&mut self, backend: BackendId) {
        if let Some(first) = self.entries.front() {
            self.positions.insert(backend, first.id);
        }
    }

    pub fn position(&self, backend: BackendId) -> Option<u32> {
        self.positions.get(&backend).copied()
    }

    pub fn advance_position(&mut self, backend: BackendId, id: u32) {
        self.positions.insert(backend, id);
    }

    pub fn forget_backend(&mut self, backend: BackendId) {
        self.positions.remove(&backend);
    }

    /// Entries to replay on a fresh backend, oldest first.
    pub fn replay_entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Compare a replayed reply with the accepted one. `Err` carries the
    /// diverging id, which closes the backend with a permanent error.
    pub fn verify_replay(&self, id: u32, is_ok: bool) -> Result<(), u32> {
        match self.responses.get(&id) {
            Some(accepted) if *accepted == is_ok => Ok(()),
            _ => Err(id),
        }
    }

    /// Apply the configured prune policy. Entries below the minimum pinned
    /// position of all live backends are unreferenced and can go; the
    /// bounded policy additionally caps the entry count.
    pub fn prune(&mut self) {
        match self.config.prune_policy {
            HistoryPrunePolicy::Disabled => return,
            HistoryPrunePolicy::PruneFromMin => self.prune_below_min(),
            HistoryPrunePolicy::Bounded => {
                self.prune_below_min();
                while self.entries.len() > self.config.max_entries {
                    if let Some(dropped) = self.entries.pop_front() {
                        info!("History cap reached, dropping entry {}", dropped.id);
                        self.responses.remove(&dropped.id);
                    }
                }
            }
        }
    }

    fn prune_below_min(&mut self) {
        let Some(min_position) = self.positions.values().min().copied() else {
            return;
        };
        while let Some(front) = self.entries.front() {
            if front.id < min_position {
                let dropped = self.entries.pop_front().unwrap();
                self.responses.remove(&dropped.id);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(policy: HistoryPrunePolicy, cap: usize) -> SessionHistory {
        SessionHistory::new(HistoryConfig {
            prune_policy: policy,
            max_entries: cap,
        })
    }

    fn push(history: &mut SessionHistory, sql: &[u8], is_ok: bool) -> u32 {
        let id = history.allocate_id();
        history.record(id, sql.to_vec());
        assert_eq!(history.deliver_response(id, is_ok), ResponseOutcome::Accepted);
        id
    }

    #[test]
    fn ids_skip_zero_and_top() {
        let mut history = history(HistoryPrunePolicy::Disabled, 0);
        assert_eq!(history.allocate_id(), 1);
        history.next_id = ID_MAX;
        assert_eq!(history.allocate_id(), ID_MAX);
        assert_eq!(history.allocate_id(), 1);
    }

    #[test]
    fn replay_matches_accepted_sequence() {
        let mut history = history(HistoryPrunePolicy::Disabled, 0);
        let a = push(&mut history, b"SET autocommit=0", true);
        let b = push(&mut history, b"SET @x=1", true);
        let c = push(&mut history, b"SET ROLE admin", false);

        let replayed: Vec<u32> = history.replay_entries().map(|e| e.id).collect();
        assert_eq!(replayed, vec![a, b, c]);

        assert!(history.verify_replay(a, true).is_ok());
        assert!(history.verify_replay(b, true).is_ok());
        assert!(history.verify_replay(c, false).is_ok());
        // a divergent replay names the entry
        assert_eq!(history.verify_replay(c, true), Err(c));
    }

    #[test]
    fn late_responses_verify_only() {
        let mut history = history(HistoryPrunePolicy::Disabled, 0);
        let id = push(&mut history, b"SET sql_mode=''", true);
        assert_eq!(history.deliver_response(id, true), ResponseOutcome::Match);
        assert_eq!(history.deliver_response(id, false), ResponseOutcome::Mismatch);
    }

    #[test]
    fn prune_from_min_respects_pins() {
        let mut history = history(HistoryPrunePolicy::PruneFromMin, 0);
        let a = push(&mut history, b"SET @a=1", true);
        let _b = push(&mut history, b"SET @b=2", true);
        let c = push(&mut history, b"SET @c=3", true);

        history.advance_position(1, a);
        history.advance_position(2, c);
        history.prune();
        assert_eq!(history.len(), 3);

        history.advance_position(1, c);
        history.prune();
        assert_eq!(history.len(), 1);
        assert_eq!(history.replay_entries().next().unwrap().id, c);
    }

    #[test]
    fn bounded_caps_entries() {
        let mut history = history(HistoryPrunePolicy::Bounded, 2);
        for i in 0..5 {
            push(&mut history, format!("SET @v={i}").as_bytes(), true);
        }
        history.prune();
        assert_eq!(history.len(), 2);
        let ids: Vec<u32> = history.replay_entries().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn pin_tracks_oldest_entry() {
        let mut history = history(HistoryPrunePolicy::PruneFromMin, 0);
        let a = push(&mut history, b"USE shop", true);
        history.pin(7);
        assert_eq!(history.position(7), Some(a));
        history.forget_backend(7);
        assert_eq!(history.position(7), None);
    }
}
