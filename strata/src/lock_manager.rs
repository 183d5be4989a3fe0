//! Two-phase locking at row granularity with table-level intention locks.
//!
//! Lock requests queue FIFO per resource and block on a condition
//! variable. A blocked request re-checks every [`DEADLOCK_CHECK_INTERVAL`]
//! and runs a wait-for-graph cycle search; when a cycle is found, the
//! youngest transaction in it is chosen as the victim and observes
//! [`LockError::Deadlock`]. Waits are bounded by [`LOCK_TIMEOUT`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::{Rid, TxnId};

/// How long a request may block before a wait-for cycle check runs.
pub const DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on any single lock wait.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("deadlock detected; transaction chosen as victim")]
    Deadlock,

    #[error("lock wait timed out")]
    Timeout,
}

/// Standard multi-granularity lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// The standard compatibility matrix.
    fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (IntentShared, Exclusive) | (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// Whether holding `self` already satisfies a request for `other`.
    fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(other, Shared | IntentShared),
            IntentExclusive => matches!(other, IntentExclusive | IntentShared),
            IntentShared => matches!(other, IntentShared),
        }
    }

    /// The weakest single mode at least as strong as both. With no SIX
    /// mode, Shared + IntentExclusive escalates to Exclusive.
    fn combine(self, other: LockMode) -> LockMode {
        if self.covers(other) {
            self
        } else if other.covers(self) {
            other
        } else {
            LockMode::Exclusive
        }
    }
}

/// A lockable resource. Tables are identified by their catalog id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Table(u32),
    Row(u32, Rid),
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
}

impl LockQueue {
    fn position_of(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    /// All granted holders other than `txn_id` are compatible with `mode`.
    fn others_compatible(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.requests
            .iter()
            .filter(|r| r.granted && r.txn_id != txn_id)
            .all(|r| LockMode::compatible(r.mode, mode))
    }

    /// Grant waiting requests in FIFO order, stopping at the first that
    /// stays incompatible.
    fn grant_in_order(&mut self) {
        for i in 0..self.requests.len() {
            if self.requests[i].granted {
                continue;
            }
            let (txn_id, mode) = (self.requests[i].txn_id, self.requests[i].mode);
            if self.others_compatible(txn_id, mode) {
                self.requests[i].granted = true;
            } else {
                break;
            }
        }
    }
}

#[derive(Default)]
struct LockState {
    queues: HashMap<LockTarget, LockQueue>,
    /// Transactions doomed as deadlock victims; they fail on next wakeup.
    victims: HashSet<TxnId>,
}

#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
    cvar: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire (or upgrade to) `mode` on `target` for `txn_id`, blocking
    /// until compatible. Granted locks are held until [`Self::unlock_all`].
    pub fn lock(
        &self,
        txn_id: TxnId,
        target: LockTarget,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let mut state = self.state.lock().unwrap();

        let queue = state.queues.entry(target).or_default();
        // `Some(held)` when this is an upgrade of an already granted lock.
        let upgrade_from: Option<LockMode> = match queue.position_of(txn_id) {
            Some(pos) if queue.requests[pos].granted => {
                let held = queue.requests[pos].mode;
                if held.covers(mode) {
                    return Ok(());
                }
                let combined = held.combine(mode);
                debug!("txn {txn_id} upgrading {held:?} -> {combined:?} on {target:?}");
                queue.requests[pos].mode = combined;
                // The old grant stays held while the upgrade waits.
                Some(held)
            }
            Some(pos) => Some(queue.requests[pos].mode),
            None => {
                queue.requests.push_back(LockRequest {
                    txn_id,
                    mode,
                    granted: false,
                });
                None
            }
        };
        let upgrading = upgrade_from.is_some();

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let queue = state.queues.get_mut(&target).unwrap();
            if !upgrading {
                queue.grant_in_order();
            }

            let pos = queue.position_of(txn_id).unwrap();
            let want = queue.requests[pos].mode;
            let satisfied = if upgrading {
                queue.others_compatible(txn_id, want)
            } else {
                queue.requests[pos].granted
            };
            if satisfied {
                queue.requests[pos].granted = true;
                self.cvar.notify_all();
                return Ok(());
            }

            if state.victims.remove(&txn_id) {
                self.abandon_request(&mut state, txn_id, target, upgrade_from);
                return Err(LockError::Deadlock);
            }

            if Instant::now() >= deadline {
                warn!("txn {txn_id} timed out waiting for {target:?}");
                self.abandon_request(&mut state, txn_id, target, upgrade_from);
                return Err(LockError::Timeout);
            }

            // Blocked past the threshold: look for a wait-for cycle.
            if let Some(cycle) = self.find_cycle(txn_id, &state) {
                let victim = *cycle.iter().max().unwrap();
                debug!("deadlock cycle {cycle:?}; victim txn {victim}");
                if victim == txn_id {
                    self.abandon_request(&mut state, txn_id, target, upgrade_from);
                    return Err(LockError::Deadlock);
                }
                state.victims.insert(victim);
                self.cvar.notify_all();
            }

            let (next, _timeout) = self
                .cvar
                .wait_timeout(state, DEADLOCK_CHECK_INTERVAL)
                .unwrap();
            state = next;
        }
    }

    /// Drop a request that will never be granted. A failed upgrade keeps
    /// the previously held mode; the lock itself is released with the rest
    /// at abort via `unlock_all`.
    fn abandon_request(
        &self,
        state: &mut LockState,
        txn_id: TxnId,
        target: LockTarget,
        upgrade_from: Option<LockMode>,
    ) {
        if let Some(queue) = state.queues.get_mut(&target) {
            match upgrade_from {
                Some(held) => {
                    if let Some(pos) = queue.position_of(txn_id) {
                        queue.requests[pos].mode = held;
                    }
                }
                None => {
                    queue.requests.retain(|r| r.txn_id != txn_id);
                    if queue.requests.is_empty() {
                        state.queues.remove(&target);
                    } else {
                        queue.grant_in_order();
                    }
                }
            }
        }
        self.cvar.notify_all();
    }

    /// Release every lock held or requested by `txn_id` (the shrinking
    /// phase happens all at once, at commit or abort).
    pub fn unlock_all(&self, txn_id: TxnId) {
        let mut state = self.state.lock().unwrap();
        state.victims.remove(&txn_id);
        state.queues.retain(|_, queue| {
            queue.requests.retain(|r| r.txn_id != txn_id);
            !queue.requests.is_empty()
        });
        for queue in state.queues.values_mut() {
            queue.grant_in_order();
        }
        self.cvar.notify_all();
    }

    /// Build the wait-for edges out of the current queues and search for a
    /// cycle reachable from `start`. Returns the transactions on the cycle.
    fn find_cycle(&self, start: TxnId, state: &LockState) -> Option<Vec<TxnId>> {
        let mut edges: HashMap<TxnId, HashSet<TxnId>> = HashMap::new();
        for queue in state.queues.values() {
            for waiter in queue.requests.iter() {
                let waiting = if waiter.granted {
                    // A granted request can still wait as an upgrade; it
                    // waits if some other holder is incompatible.
                    !queue.others_compatible(waiter.txn_id, waiter.mode)
                } else {
                    true
                };
                if !waiting {
                    continue;
                }
                for holder in queue.requests.iter().filter(|r| r.granted) {
                    if holder.txn_id != waiter.txn_id
                        && !LockMode::compatible(holder.mode, waiter.mode)
                    {
                        edges.entry(waiter.txn_id).or_default().insert(holder.txn_id);
                    }
                }
            }
        }

        let mut path = Vec::new();
        let mut visited = HashSet::new();
        Self::dfs(start, &edges, &mut visited, &mut path)
    }

    fn dfs(
        current: TxnId,
        edges: &HashMap<TxnId, HashSet<TxnId>>,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(pos) = path.iter().position(|&t| t == current) {
            return Some(path[pos..].to_vec());
        }
        if !visited.insert(current) {
            return None;
        }
        path.push(current);
        if let Some(next) = edges.get(&current) {
            for &n in next {
                if let Some(cycle) = Self::dfs(n, edges, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }
}
