/**
 * Reader/writer gate separating normal cache operations from a resync
 *
 * Readers only ever wait for an active writer, never for a queued one. A
 * reader may block on work done by other readers (e.g. a get waiting for a
 * worker to process its key), so letting a pending resync hold back new
 * readers would deadlock.
 */
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writing: bool,
}

#[derive(Debug, Default)]
pub struct ResyncGate {
    state: Mutex<GateState>,
    cond: Notify,
}

/// Shared access, released on drop
#[derive(Debug)]
pub struct ReadGuard<'a> {
    gate: &'a ResyncGate,
}

/// Exclusive access, released on drop
#[derive(Debug)]
pub struct WriteGuard<'a> {
    gate: &'a ResyncGate,
}

impl ResyncGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no resync is running, then enter as a reader
    pub async fn read(&self) -> ReadGuard<'_> {
        loop {
            let notified = self.cond.notified();
            {
                let mut state = self.lock();
                if !state.writing {
                    state.readers += 1;
                    return ReadGuard { gate: self };
                }
            }
            notified.await;
        }
    }

    /// Wait until all readers and any other writer are gone, then enter
    /// exclusively
    pub async fn write(&self) -> WriteGuard<'_> {
        loop {
            let notified = self.cond.notified();
            {
                let mut state = self.lock();
                if !state.writing && state.readers == 0 {
                    state.writing = true;
                    return WriteGuard { gate: self };
                }
            }
            notified.await;
        }
    }

    /// Whether a resync currently holds the gate
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.lock().writing
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        state.readers = state.readers.saturating_sub(1);
        let last = state.readers == 0;
        drop(state);
        if last {
            self.gate.cond.notify_waiters();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.gate.lock().writing = false;
        self.gate.cond.notify_waiters();
    }
}
