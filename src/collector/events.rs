//! Collector event flags
//!
//! Timer callbacks and collaborators never mutate collector state directly;
//! they set a flag here and wake the collector thread, which does all the
//! work on its own stack.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Start (or restart after a co-processor reset) requested
pub const EVT_START: u16 = 0x0001;
/// Tracking clock fired
pub const EVT_TRACKING: u16 = 0x0002;
/// Config clock fired (or a config pass was requested)
pub const EVT_CONFIG: u16 = 0x0004;
/// Broadcast command clock fired
pub const EVT_BROADCAST: u16 = 0x0008;
/// OAD reset-request retry clock fired
pub const EVT_OAD_RESET_RETRY: u16 = 0x0010;

/// Condvar-backed event flag set shared by the collector and its timers
pub struct EventSignal {
    flags: Mutex<u16>,
    cond: Condvar,
}

impl EventSignal {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Set a flag and wake the collector.
    pub fn post(&self, flag: u16) {
        let mut flags = self.flags.lock();
        *flags |= flag;
        self.cond.notify_one();
    }

    /// True if the flag is set but not yet consumed.
    pub fn pending(&self, flag: u16) -> bool {
        *self.flags.lock() & flag != 0
    }

    /// Take and clear all pending flags, waiting up to `timeout` for at
    /// least one to arrive. Returns 0 on timeout.
    pub fn take(&self, timeout: Duration) -> u16 {
        let mut flags = self.flags.lock();
        if *flags == 0 {
            self.cond.wait_for(&mut flags, timeout);
        }
        std::mem::take(&mut *flags)
    }
}

impl Default for EventSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_take_clears() {
        let signal = EventSignal::new();
        signal.post(EVT_CONFIG);
        signal.post(EVT_TRACKING);
        assert!(signal.pending(EVT_CONFIG));

        let flags = signal.take(Duration::from_millis(1));
        assert_eq!(flags, EVT_CONFIG | EVT_TRACKING);
        assert!(!signal.pending(EVT_CONFIG));
        assert_eq!(signal.take(Duration::from_millis(1)), 0);
    }

    #[test]
    fn take_wakes_on_post() {
        let signal = Arc::new(EventSignal::new());
        let poster = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post(EVT_START);
        });

        let flags = signal.take(Duration::from_secs(5));
        assert_eq!(flags, EVT_START);
        handle.join().unwrap();
    }
}
