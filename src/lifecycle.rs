//! Lifecycle of handles and rings, and the cancellation token feeding it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::api::Result;

/// Lifecycle of a handle, ring or injection handle. Transitions only move
/// forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    Operational = 0,
    /// Cancelled: no further I/O, only close.
    NonOperational = 1,
    Closed = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Operational,
            1 => State::NonOperational,
            _ => State::Closed,
        }
    }
}

/// Atomically observed [`State`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new() -> Self {
        Self(AtomicU8::new(State::Operational as u8))
    }

    #[inline]
    pub fn get(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_operational(&self) -> bool {
        self.get() == State::Operational
    }

    /// Moves to `to` unless already past it. Returns the previous state.
    pub fn advance(&self, to: State) -> State {
        State::from_u8(self.0.fetch_max(to as u8, Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Moves a handle to [`State::NonOperational`] and wakes its blocked calls.
///
/// Cheap to clone and safe to fire from any thread, including a
/// process-level signal handler thread.
#[derive(Clone)]
pub struct Canceller {
    cancel: Arc<dyn Fn() -> Result<()> + Send + Sync>,
}

impl Canceller {
    pub(crate) fn new(cancel: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// Idempotent.
    pub fn cancel(&self) -> Result<()> {
        (self.cancel)()
    }

    /// Fires every canceller in `all`, reporting the first failure.
    pub fn join(all: impl IntoIterator<Item = Canceller>) -> Self {
        let all: Vec<Canceller> = all.into_iter().collect();
        Self::new(move || {
            let mut res = Ok(());
            for c in &all {
                if let Err(e) = c.cancel() {
                    if res.is_ok() {
                        res = Err(e);
                    }
                }
            }
            res
        })
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceller").finish()
    }
}
