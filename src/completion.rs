//! Single-shot completion gate and run cancellation.
//!
//! The agent callback thread fires the gate once; the orchestrator waits on
//! it once. The first outcome wins and later fires are ignored, so the gate
//! doubles as the happens-before barrier for everything the callback wrote.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// How the agent side of a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The agent reported `done` and every transfer succeeded.
    Completed,
    /// The stream was cut short by failed transfers.
    CompletedWithErrors(Vec<String>),
    /// The operator interrupted the run.
    Cancelled,
}

impl RunOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Default)]
struct GateState {
    outcome: Option<RunOutcome>,
}

#[derive(Clone, Default)]
pub struct CompletionGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `outcome` and wakes all waiters. Returns `false` when the gate
    /// had already fired, in which case nothing changes.
    pub fn fire(&self, outcome: RunOutcome) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut state = lock_state(lock);
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        cvar.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        lock_state(&self.inner.0).outcome.is_some()
    }

    /// Blocks without a deadline until the gate fires.
    pub fn wait(&self) -> RunOutcome {
        let (lock, cvar) = &*self.inner;
        let mut state = lock_state(lock);
        loop {
            if let Some(outcome) = state.outcome.as_ref() {
                return outcome.clone();
            }
            state = cvar.wait(state).unwrap_or_else(|poison| poison.into_inner());
        }
    }
}

fn lock_state<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poison| poison.into_inner())
}

type CancelCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    callbacks: Vec<CancelCallback>,
}

/// Cloneable cancellation flag. Blocking waits register a wake-up callback
/// so cancellation reaches them without polling.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<CancelState>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let callbacks = {
            let mut state = lock_state(&self.inner);
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        lock_state(&self.inner).cancelled
    }

    /// Runs `callback` once on cancellation, immediately if already cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock_state(&self.inner);
        if state.cancelled {
            drop(state);
            callback();
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }
}
