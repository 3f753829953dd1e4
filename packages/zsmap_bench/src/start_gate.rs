use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GateState {
    Closed,
    Open,
    Cancelled,
}

/// Holds workers back until every one of them is ready, then releases them together.
///
/// The gate changes state at most once. Whichever of [`open()`][Self::open] and
/// [`cancel()`][Self::cancel] comes first wins and later calls are ignored.
#[derive(Debug)]
pub(crate) struct StartGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl StartGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        self.settle(GateState::Open);
    }

    pub(crate) fn cancel(&self) {
        self.settle(GateState::Cancelled);
    }

    /// Blocks until the gate leaves the closed state. Returns `true` if it was opened.
    pub(crate) fn wait(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let state = self
            .changed
            .wait_while(state, |state| *state == GateState::Closed)
            .unwrap_or_else(PoisonError::into_inner);

        *state == GateState::Open
    }

    fn settle(&self, to: GateState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if *state == GateState::Closed {
            *state = to;
            self.changed.notify_all();
        }
    }
}
