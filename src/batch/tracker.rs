//! Outcome tracker: the single writer of every operation's state.
//!
//! All bookkeeping (state table, outstanding count, zero-crossing signal) lives
//! behind one mutex, so "decrement, check zero, signal" is one critical section
//! no matter which worker thread a completion arrives on.

use super::operation::{FailureReason, OperationId, OperationState, Outcome, StateKind};
use crate::error::Defect;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// Point-in-time counters of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrackerCounts {
    pub total: usize,
    pub outstanding: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Terminal states of a drained batch, keyed by operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcomes {
    pub succeeded: BTreeSet<OperationId>,
    pub failures: BTreeMap<OperationId, FailureReason>,
    pub cancelled: BTreeSet<OperationId>,
}

#[derive(Debug)]
struct State {
    ops: Vec<OperationState>,
    counts: TrackerCounts,
    sealed: bool,
    drained_at: Option<Instant>,
    defects: Vec<Defect>,
}

pub struct OutcomeTracker {
    state: Mutex<State>,
    drained: watch::Sender<bool>,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                ops: Vec::new(),
                counts: TrackerCounts::default(),
                sealed: false,
                drained_at: None,
                defects: Vec::new(),
            }),
            drained,
        }
    }

    // No panics happen while the lock is held; a poisoned guard is still consistent.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `Pending` operation and count it as outstanding.
    ///
    /// Returns `None` once the tracker is sealed.
    pub fn enqueue(&self) -> Option<OperationId> {
        let mut st = self.lock();
        if st.sealed {
            return None;
        }
        let id = OperationId(st.ops.len());
        st.ops.push(OperationState::Pending);
        st.counts.total += 1;
        st.counts.outstanding += 1;
        st.counts.pending += 1;
        Some(id)
    }

    /// Close the batch to new operations. Zero-crossings only count from here
    /// on; an empty batch drains immediately.
    pub fn seal(&self) {
        let mut st = self.lock();
        if st.sealed {
            return;
        }
        st.sealed = true;
        if st.counts.outstanding == 0 {
            self.signal_drained(&mut st);
        }
    }

    pub fn mark_in_flight(&self, id: OperationId) -> Result<(), Defect> {
        let mut st = self.lock();
        let current = Self::state_of(&st, id)?;
        if current != StateKind::Pending {
            return Err(Self::reject(
                &mut st,
                id,
                current,
                StateKind::InFlight,
            ));
        }
        st.ops[id.0] = OperationState::InFlight;
        st.counts.pending -= 1;
        st.counts.in_flight += 1;
        Ok(())
    }

    pub fn record_success(&self, id: OperationId) -> Result<(), Defect> {
        self.finish(id, OperationState::Succeeded)
    }

    pub fn record_failure(&self, id: OperationId, reason: FailureReason) -> Result<(), Defect> {
        self.finish(id, OperationState::Failed(reason))
    }

    /// Only valid for operations that were never dispatched.
    pub fn record_cancelled(&self, id: OperationId) -> Result<(), Defect> {
        self.finish(id, OperationState::Cancelled)
    }

    pub fn record(&self, id: OperationId, outcome: Outcome) -> Result<(), Defect> {
        match outcome {
            Outcome::Success => self.record_success(id),
            Outcome::Failure(reason) => self.record_failure(id, reason),
        }
    }

    fn finish(&self, id: OperationId, to: OperationState) -> Result<(), Defect> {
        let mut st = self.lock();
        let from = Self::state_of(&st, id)?;
        let target = to.kind();
        if from.is_terminal() {
            let defect = Defect::DuplicateCompletion { id };
            st.defects.push(defect.clone());
            return Err(defect);
        }
        let allowed = match target {
            StateKind::Succeeded | StateKind::Failed => from == StateKind::InFlight,
            StateKind::Cancelled => from == StateKind::Pending,
            StateKind::Pending | StateKind::InFlight => false,
        };
        if !allowed {
            return Err(Self::reject(&mut st, id, from, target));
        }

        st.ops[id.0] = to;
        match from {
            StateKind::Pending => st.counts.pending -= 1,
            _ => st.counts.in_flight -= 1,
        }
        match target {
            StateKind::Succeeded => st.counts.succeeded += 1,
            StateKind::Failed => st.counts.failed += 1,
            _ => st.counts.cancelled += 1,
        }
        st.counts.outstanding -= 1;
        if st.counts.outstanding == 0 && st.sealed {
            self.signal_drained(&mut st);
        }
        Ok(())
    }

    fn state_of(st: &State, id: OperationId) -> Result<StateKind, Defect> {
        st.ops
            .get(id.0)
            .map(OperationState::kind)
            .ok_or(Defect::UnknownOperation { id })
    }

    fn reject(st: &mut State, id: OperationId, from: StateKind, to: StateKind) -> Defect {
        let defect = Defect::InvalidTransition { id, from, to };
        st.defects.push(defect.clone());
        defect
    }

    fn signal_drained(&self, st: &mut State) {
        if st.drained_at.is_none() {
            st.drained_at = Some(Instant::now());
            self.drained.send_replace(true);
        }
    }

    /// Receiver that flips to `true` exactly once, when the batch drains.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.drained.subscribe()
    }

    pub fn is_drained(&self) -> bool {
        self.lock().drained_at.is_some()
    }

    pub fn drained_at(&self) -> Option<Instant> {
        self.lock().drained_at
    }

    pub fn counts(&self) -> TrackerCounts {
        self.lock().counts
    }

    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        self.lock().ops.get(id.0).cloned()
    }

    pub fn pending_ids(&self) -> Vec<OperationId> {
        self.lock()
            .ops
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, OperationState::Pending))
            .map(|(i, _)| OperationId(i))
            .collect()
    }

    pub fn defects(&self) -> Vec<Defect> {
        self.lock().defects.clone()
    }

    pub fn outcomes(&self) -> Outcomes {
        let st = self.lock();
        let mut out = Outcomes::default();
        for (i, s) in st.ops.iter().enumerate() {
            let id = OperationId(i);
            match s {
                OperationState::Succeeded => {
                    out.succeeded.insert(id);
                }
                OperationState::Failed(reason) => {
                    out.failures.insert(id, reason.clone());
                }
                OperationState::Cancelled => {
                    out.cancelled.insert(id);
                }
                OperationState::Pending | OperationState::InFlight => {}
            }
        }
        out
    }

    /// Recount from the state table and compare with the running counters.
    pub fn counts_consistent(&self) -> bool {
        let st = self.lock();
        let non_terminal = st.ops.iter().filter(|s| !s.is_terminal()).count();
        non_terminal == st.counts.outstanding
            && st.counts.outstanding == st.counts.pending + st.counts.in_flight
            && st.counts.total
                == st.counts.outstanding
                    + st.counts.succeeded
                    + st.counts.failed
                    + st.counts.cancelled
    }
}

impl Default for OutcomeTracker {
    fn default() -> Self {
        Self::new()
    }
}
