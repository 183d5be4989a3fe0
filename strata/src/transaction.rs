//! Transaction lifecycle bookkeeping.
//!
//! Ids are allocated monotonically; each transaction walks the state
//! machine `Active → Committing → Committed` or `Active → Aborting →
//! Aborted`. Terminal states are final: any operation against a committed
//! or aborted transaction fails with [`TxnError::Closed`]. The manager
//! also tracks the head of each transaction's backward WAL chain.
//!
//! Commit and rollback *orchestration* (WAL records, page flushes, lock
//! release) belongs to the engine layer; this type only vends ids and
//! guards state transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use log::debug;
use thiserror::Error;

use crate::wal::{Lsn, NULL_LSN};
use crate::TxnId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxnError {
    #[error("transaction {0} is closed")]
    Closed(TxnId),

    #[error("unknown transaction {0}")]
    Unknown(TxnId),

    #[error("transaction {txn_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        txn_id: TxnId,
        from: TxnState,
        to: TxnState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}

#[derive(Debug, Default)]
struct TxnTables {
    states: HashMap<TxnId, TxnState>,
    last_lsns: HashMap<TxnId, Lsn>,
}

#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    tables: Mutex<TxnTables>,
}

impl TransactionManager {
    pub fn new(initial_txn_id: TxnId) -> Self {
        debug!("transaction manager starting at txn id {initial_txn_id}");
        Self {
            next_txn_id: AtomicU32::new(initial_txn_id.max(1)),
            tables: Mutex::new(TxnTables::default()),
        }
    }

    /// Start a transaction and return its fresh id.
    pub fn begin(&self) -> TxnId {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();
        tables.states.insert(txn_id, TxnState::Active);
        tables.last_lsns.insert(txn_id, NULL_LSN);
        debug!("begin txn {txn_id}");
        txn_id
    }

    pub fn state(&self, txn_id: TxnId) -> Option<TxnState> {
        self.tables.lock().unwrap().states.get(&txn_id).copied()
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.state(txn_id) == Some(TxnState::Active)
    }

    /// Ids of all transactions not yet in a terminal state.
    pub fn live_txns(&self) -> Vec<TxnId> {
        self.tables
            .lock()
            .unwrap()
            .states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Fail unless the transaction exists and is `Active`.
    pub fn ensure_active(&self, txn_id: TxnId) -> Result<(), TxnError> {
        match self.state(txn_id) {
            Some(TxnState::Active) => Ok(()),
            Some(_) => Err(TxnError::Closed(txn_id)),
            None => Err(TxnError::Unknown(txn_id)),
        }
    }

    /// LSN of the transaction's most recent WAL record (`NULL_LSN` if it
    /// has not logged anything yet).
    pub fn last_lsn(&self, txn_id: TxnId) -> Lsn {
        self.tables
            .lock()
            .unwrap()
            .last_lsns
            .get(&txn_id)
            .copied()
            .unwrap_or(NULL_LSN)
    }

    pub fn record_lsn(&self, txn_id: TxnId, lsn: Lsn) {
        self.tables.lock().unwrap().last_lsns.insert(txn_id, lsn);
    }

    fn transition(
        &self,
        txn_id: TxnId,
        allowed: &[TxnState],
        next: TxnState,
    ) -> Result<(), TxnError> {
        let mut tables = self.tables.lock().unwrap();
        let Some(&current) = tables.states.get(&txn_id) else {
            return Err(TxnError::Unknown(txn_id));
        };
        if current.is_terminal() {
            return Err(TxnError::Closed(txn_id));
        }
        if !allowed.contains(&current) {
            return Err(TxnError::InvalidTransition {
                txn_id,
                from: current,
                to: next,
            });
        }
        tables.states.insert(txn_id, next);
        Ok(())
    }

    pub fn begin_commit(&self, txn_id: TxnId) -> Result<(), TxnError> {
        self.transition(txn_id, &[TxnState::Active], TxnState::Committing)
    }

    pub fn finish_commit(&self, txn_id: TxnId) -> Result<(), TxnError> {
        let res = self.transition(txn_id, &[TxnState::Committing], TxnState::Committed);
        if res.is_ok() {
            self.tables.lock().unwrap().last_lsns.remove(&txn_id);
            debug!("txn {txn_id} committed");
        }
        res
    }

    /// Revert a commit that failed before its WAL record became durable.
    pub fn fail_commit(&self, txn_id: TxnId) -> Result<(), TxnError> {
        self.transition(txn_id, &[TxnState::Committing], TxnState::Active)
    }

    pub fn begin_abort(&self, txn_id: TxnId) -> Result<(), TxnError> {
        self.transition(
            txn_id,
            &[TxnState::Active, TxnState::Committing],
            TxnState::Aborting,
        )
    }

    pub fn finish_abort(&self, txn_id: TxnId) -> Result<(), TxnError> {
        let res = self.transition(txn_id, &[TxnState::Aborting], TxnState::Aborted);
        if res.is_ok() {
            self.tables.lock().unwrap().last_lsns.remove(&txn_id);
            debug!("txn {txn_id} aborted");
        }
        res
    }
}
