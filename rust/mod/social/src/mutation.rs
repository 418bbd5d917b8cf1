//! Optimistic mutations.
//!
//! Every user action that changes owned state before the backend confirms
//! it goes through a [`MutationLedger`]: the controller applies the change,
//! records a snapshot of what it replaced, and later settles the mutation
//! as confirmed or rolled back.
//!
//! Several mutations on the same key may be in flight at once (like,
//! unlike, like). Each one snapshots the value it actually replaced, so a
//! later action always builds on the current value. Rolling back:
//! - the newest mutation on a key restores its snapshot;
//! - an older one hands its snapshot to the next pending mutation on that
//!   key, so that one restores the older value if it fails too;
//! - an older one whose successors are all confirmed restores nothing.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Applied,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone)]
struct Pending<K, S> {
    id: MutationId,
    key: K,
    snapshot: S,
}

/// Outcome of rolling a mutation back.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback<S> {
    /// Put this snapshot back into owned state.
    Restore(S),
    /// A later mutation on the same key now owns the restoration.
    Superseded,
    /// The id is unknown or already settled.
    Stale,
}

pub struct MutationLedger<K, S> {
    next_id: u64,
    pending: Vec<Pending<K, S>>,
    latest: HashMap<K, MutationId>,
    settled: HashMap<MutationId, MutationPhase>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, S: Clone> MutationLedger<K, S> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: Vec::new(),
            latest: HashMap::new(),
            settled: HashMap::new(),
        }
    }

    /// Record an optimistic change to `key` that replaced `snapshot`.
    pub fn apply(&mut self, key: K, snapshot: S) -> MutationId {
        let id = MutationId(self.next_id);
        self.next_id += 1;
        trace!(?key, ?id, "mutation applied");
        self.latest.insert(key.clone(), id);
        self.pending.push(Pending { id, key, snapshot });
        id
    }

    /// The backend accepted the mutation; its optimistic state stands.
    pub fn confirm(&mut self, id: MutationId) -> bool {
        match self.take(id) {
            Some(p) => {
                self.finish(&p.key, id, MutationPhase::Confirmed);
                true
            }
            None => false,
        }
    }

    /// The backend rejected the mutation.
    pub fn roll_back(&mut self, id: MutationId) -> Rollback<S> {
        let Some(p) = self.take(id) else {
            return Rollback::Stale;
        };
        let is_latest = self.latest.get(&p.key) == Some(&id);
        let successor = self
            .pending
            .iter_mut()
            .find(|q| q.key == p.key && q.id > id);
        let outcome = match (is_latest, successor) {
            (true, _) => Rollback::Restore(p.snapshot),
            (false, Some(next)) => {
                debug!(key = ?p.key, ?id, next = ?next.id, "rollback handed to successor");
                next.snapshot = p.snapshot;
                Rollback::Superseded
            }
            (false, None) => Rollback::Superseded,
        };
        if is_latest {
            // The newest surviving mutation on the key takes over.
            let newest = self
                .pending
                .iter()
                .filter(|q| q.key == p.key)
                .map(|q| q.id)
                .max();
            if let Some(newest) = newest {
                self.latest.insert(p.key.clone(), newest);
            }
        }
        self.finish(&p.key, id, MutationPhase::RolledBack);
        outcome
    }

    pub fn phase(&self, id: MutationId) -> Option<MutationPhase> {
        if self.pending.iter().any(|p| p.id == id) {
            return Some(MutationPhase::Applied);
        }
        self.settled.get(&id).copied()
    }

    /// Whether any mutation on `key` is awaiting the backend.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.iter().any(|p| &p.key == key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forget everything (page dispose, sign-out).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.latest.clear();
        self.settled.clear();
    }

    fn take(&mut self, id: MutationId) -> Option<Pending<K, S>> {
        let pos = self.pending.iter().position(|p| p.id == id)?;
        Some(self.pending.remove(pos))
    }

    fn finish(&mut self, key: &K, id: MutationId, phase: MutationPhase) {
        if !self.is_pending(key) {
            self.latest.remove(key);
        }
        self.settled.insert(id, phase);
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, S: Clone> Default for MutationLedger<K, S> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Own-echo guard ──────────────────────────────────────────────────

/// Own mutations whose real-time echo has not arrived yet.
///
/// When the current user likes a post, the like count moves immediately;
/// the backend then pushes the same like back as a change event. Matching
/// echoes are consumed here so the count does not move twice. Entries
/// expire after `window` in case the echo never comes.
#[derive(Debug, Clone)]
pub struct PendingEchoes<K> {
    window: Duration,
    entries: VecDeque<Echo<K>>,
}

#[derive(Debug, Clone)]
struct Echo<K> {
    key: K,
    added: bool,
    expires_at: DateTime<Utc>,
}

impl<K: PartialEq> PendingEchoes<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    /// Expect an echo of `(key, added)`.
    pub fn expect(&mut self, key: K, added: bool, now: DateTime<Utc>) {
        self.prune(now);
        self.entries.push_back(Echo {
            key,
            added,
            expires_at: now + self.window,
        });
    }

    /// If `(key, added)` is an expected echo, forget it and return true.
    pub fn consume(&mut self, key: &K, added: bool, now: DateTime<Utc>) -> bool {
        self.prune(now);
        match self.entries.iter().position(|e| &e.key == key && e.added == added) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// The mutation failed; no echo will come.
    pub fn cancel(&mut self, key: &K, added: bool) {
        if let Some(i) = self
            .entries
            .iter()
            .rposition(|e| &e.key == key && e.added == added)
        {
            self.entries.remove(i);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|e| e.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Ledger = MutationLedger<&'static str, u32>;

    // ========================================================================
    // Single mutation
    // ========================================================================

    #[test]
    fn confirm_moves_to_confirmed() {
        let mut ledger = Ledger::new();
        let id = ledger.apply("p1", 15);
        assert_eq!(ledger.phase(id), Some(MutationPhase::Applied));
        assert!(ledger.confirm(id));
        assert_eq!(ledger.phase(id), Some(MutationPhase::Confirmed));
        assert!(!ledger.confirm(id));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn rollback_restores_snapshot() {
        let mut ledger = Ledger::new();
        let id = ledger.apply("p1", 15);
        assert_eq!(ledger.roll_back(id), Rollback::Restore(15));
        assert_eq!(ledger.phase(id), Some(MutationPhase::RolledBack));
        assert_eq!(ledger.roll_back(id), Rollback::Stale);
    }

    // ========================================================================
    // Interleaving on one key
    // ========================================================================

    #[test]
    fn older_failure_hands_snapshot_to_successor() {
        let mut ledger = Ledger::new();
        let first = ledger.apply("p1", 15); // 15 -> 16
        let second = ledger.apply("p1", 16); // 16 -> 15

        assert_eq!(ledger.roll_back(first), Rollback::Superseded);
        assert_eq!(ledger.roll_back(second), Rollback::Restore(15));
    }

    #[test]
    fn newest_failure_restores_its_own_snapshot() {
        let mut ledger = Ledger::new();
        let first = ledger.apply("p1", 15);
        let second = ledger.apply("p1", 16);

        assert_eq!(ledger.roll_back(second), Rollback::Restore(16));
        // `first` is now the newest pending mutation on the key.
        assert_eq!(ledger.roll_back(first), Rollback::Restore(15));
    }

    #[test]
    fn older_failure_after_confirmed_successor_is_ignored() {
        let mut ledger = Ledger::new();
        let first = ledger.apply("p1", 15);
        let second = ledger.apply("p1", 16);
        assert!(ledger.confirm(second));
        assert_eq!(ledger.roll_back(first), Rollback::Superseded);
    }

    #[test]
    fn keys_are_independent() {
        let mut ledger = Ledger::new();
        let a = ledger.apply("p1", 1);
        let b = ledger.apply("p2", 2);
        assert_eq!(ledger.roll_back(a), Rollback::Restore(1));
        assert!(ledger.is_pending(&"p2"));
        assert_eq!(ledger.roll_back(b), Rollback::Restore(2));
    }

    // ========================================================================
    // Echoes
    // ========================================================================

    #[test]
    fn echo_consumed_once() {
        let now = Utc::now();
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        echoes.expect("p1", true, now);
        assert!(!echoes.consume(&"p1", false, now));
        assert!(echoes.consume(&"p1", true, now));
        assert!(!echoes.consume(&"p1", true, now));
    }

    #[test]
    fn echo_expires_after_window() {
        let now = Utc::now();
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        echoes.expect("p1", true, now);
        assert!(!echoes.consume(&"p1", true, now + Duration::seconds(11)));
        assert!(echoes.is_empty());
    }

    #[test]
    fn cancel_removes_latest_match() {
        let now = Utc::now();
        let mut echoes = PendingEchoes::new(Duration::seconds(10));
        echoes.expect("p1", true, now);
        echoes.expect("p1", true, now);
        echoes.cancel(&"p1", true);
        assert_eq!(echoes.len(), 1);
    }
}
