use std::sync::{Condvar, Mutex};

use mirror_common::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The expected acknowledgement arrived.
    Ok,
    /// The deadline was reached first.
    Timeout,
    /// The synchronisation was interrupted (stop).
    Interrupted,
}

struct State {
    stopped: bool,
    /// Last acknowledged sequence; acknowledgements are monotonic.
    ack: u64,
}

/// Lets a thread wait until a monotonically increasing sequence counter
/// has been acknowledged by another (used to order a local paste after
/// the device applied the clipboard).
pub struct AckSync {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for AckSync {
    fn default() -> Self {
        Self::new()
    }
}

impl AckSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                stopped: false,
                ack: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn ack(&self, sequence: u64) {
        let mut state = self.state.lock().unwrap();

        debug_assert!(sequence >= state.ack);
        if sequence > state.ack {
            state.ack = sequence;
            self.cond.notify_all();
        }
    }

    /// Wait until `ack` (or any later sequence) has been acknowledged.
    pub fn wait(&self, ack: u64, deadline: Tick) -> WaitResult {
        let mut state = self.state.lock().unwrap();

        loop {
            if state.stopped {
                return WaitResult::Interrupted;
            }
            if state.ack >= ack {
                return WaitResult::Ok;
            }

            let Some(timeout) = deadline.time_until() else {
                return WaitResult::Timeout;
            };

            (state, _) = self.cond.wait_timeout(state, timeout).unwrap();
        }
    }

    /// Interrupt every waiter, now and in the future.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_already_acknowledged() {
        let sync = AckSync::new();
        sync.ack(5);

        assert_eq!(sync.wait(3, Tick::now()), WaitResult::Ok);
        assert_eq!(sync.wait(5, Tick::now()), WaitResult::Ok);
    }

    #[test]
    fn test_timeout() {
        let sync = AckSync::new();
        let deadline = Tick::now() + Tick::from_millis(20);

        assert_eq!(sync.wait(1, deadline), WaitResult::Timeout);
    }

    #[test]
    fn test_later_sequence_releases_earlier_waiters() {
        let sync = Arc::new(AckSync::new());

        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || sync.wait(3, Tick::now() + Tick::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(10));
        // an ack with a higher sequence releases waiters on lower ones
        sync.ack(7);

        assert_eq!(waiter.join().unwrap(), WaitResult::Ok);
    }

    #[test]
    fn test_interrupt_releases_waiters() {
        let sync = Arc::new(AckSync::new());

        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || sync.wait(1, Tick::now() + Tick::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(10));
        sync.interrupt();

        assert_eq!(waiter.join().unwrap(), WaitResult::Interrupted);
        // and future waits return immediately
        assert_eq!(
            sync.wait(1, Tick::now() + Tick::from_secs(5)),
            WaitResult::Interrupted
        );
    }
}
