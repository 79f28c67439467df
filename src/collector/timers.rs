//! Re-armable one-shot timers
//!
//! Each timer owns a small named thread parked on a condvar. Arming
//! replaces any pending deadline; on expiry the timer posts its event flag
//! and goes back to sleep. The firing path never touches collector state.

use super::events::EventSignal;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TimerState {
    deadline: Option<Instant>,
    /// Bumped on every arm/cancel so a stale wakeup never fires
    generation: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// One-shot timer posting an event flag on expiry
pub struct OneShot {
    inner: Arc<TimerInner>,
    handle: Option<JoinHandle<()>>,
}

impl OneShot {
    pub fn spawn(name: &str, signal: Arc<EventSignal>, flag: u16) -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                deadline: None,
                generation: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(thread_inner, signal, flag))
            .expect("failed to spawn timer thread");

        Self {
            inner,
            handle: Some(handle),
        }
    }

    /// Arm (or re-arm) the timer.
    pub fn arm(&self, delay: Duration) {
        let mut state = self.inner.state.lock();
        state.deadline = Some(Instant::now() + delay);
        state.generation += 1;
        self.inner.cond.notify_one();
    }

    /// Clear any pending deadline.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.deadline = None;
        state.generation += 1;
        self.inner.cond.notify_one();
    }

    /// True while a deadline is pending.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().deadline.is_some()
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            self.inner.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(inner: Arc<TimerInner>, signal: Arc<EventSignal>, flag: u16) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        match state.deadline {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(deadline) => {
                let generation = state.generation;
                let timed_out = inner.cond.wait_until(&mut state, deadline).timed_out();
                // Only fire if nobody re-armed or cancelled while we slept
                if timed_out && state.generation == generation {
                    state.deadline = None;
                    signal.post(flag);
                }
            }
        }
    }
}
