//! Per-worker interruption state with deferred delivery.
//!
//! A worker may be asked to stop at any time, but persistent-store reads and
//! writes must never be abandoned halfway. Code that touches the store runs
//! inside a [`CriticalSection`]; an interrupt requested meanwhile is latched
//! and only becomes visible to [`WorkerContext::check`] once the outermost
//! section ends.
//!
//! ```text
//!  interrupt() ──▶ depth == 0 ? ──yes──▶ interrupted = true
//!                       │
//!                       no
//!                       ▼
//!                  pending = true ──(last section drops)──▶ interrupted = true
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DownloadError;

#[derive(Debug, Default)]
struct InterruptState {
    depth: usize,
    interrupted: bool,
    pending: bool,
}

/// Cooperative cancellation handle shared by a worker and the dispatcher.
///
/// Clones share state. A context created with [`WorkerContext::detached`] is
/// never interrupted unless someone holding a clone asks for it.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    state: Arc<Mutex<InterruptState>>,
}

impl WorkerContext {
    /// Context for code running outside the dispatcher.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Request an interrupt; deferred while a critical section is open.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        if state.depth > 0 {
            state.pending = true;
        } else {
            state.interrupted = true;
        }
    }

    /// Whether an interrupt has been delivered.
    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    /// Whether an interrupt is latched behind an open critical section.
    pub fn has_pending_interrupt(&self) -> bool {
        self.state.lock().pending
    }

    /// Cancellation point: fails with [`DownloadError::Interrupted`] once an
    /// interrupt has been delivered.
    pub fn check(&self) -> Result<(), DownloadError> {
        if self.is_interrupted() {
            Err(DownloadError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Enter an interrupt-sensitive section. Sections nest.
    pub fn enter_critical(&self) -> CriticalSection<'_> {
        self.state.lock().depth += 1;
        CriticalSection { ctx: self }
    }

    /// Run `f` with interrupts deferred.
    pub fn critical<T>(&self, f: impl FnOnce() -> T) -> T {
        let _section = self.enter_critical();
        f()
    }

    pub fn in_critical_section(&self) -> bool {
        self.state.lock().depth > 0
    }

    /// Forget any delivered or pending interrupt before the next job.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.interrupted = false;
        state.pending = false;
    }
}

/// Guard returned by [`WorkerContext::enter_critical`].
pub struct CriticalSection<'a> {
    ctx: &'a WorkerContext,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let mut state = self.ctx.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 && state.pending {
            state.pending = false;
            state.interrupted = true;
        }
    }
}
