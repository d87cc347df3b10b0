use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use crate::timer::{TimeoutReason, Timer};

/// A [Timer] on a simulated clock that only moves when [ManualTimer::advance] is called.
///
/// Clones share their state, so a test keeps one clone to control time while the engine owns
///  the other.
#[derive(Clone, Default)]
pub struct ManualTimer {
    inner: Arc<Mutex<ManualTimerInner>>,
}

#[derive(Default)]
struct ManualTimerInner {
    now: Duration,
    deadline: Option<(Duration, TimeoutReason)>,
    expired: VecDeque<TimeoutReason>,
    num_armed: usize,
}

impl ManualTimer {
    pub fn new() -> ManualTimer {
        ManualTimer::default()
    }

    fn lock(&self) -> MutexGuard<ManualTimerInner> {
        // a panicking test poisons the mutex, and the state is still fine for reporting
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the simulated clock forward, queueing the expiry if the deadline is reached
    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        inner.now += by;

        if let Some((deadline, reason)) = inner.deadline {
            if inner.now >= deadline {
                inner.deadline = None;
                inner.expired.push_back(reason);
            }
        }
    }

    /// Advances the clock exactly to the current deadline, if any
    pub fn fire(&self) {
        if let Some(remaining) = self.remaining() {
            self.advance(remaining);
        }
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn is_armed(&self) -> bool {
        self.lock().deadline.is_some()
    }

    /// time left until the current schedule expires
    pub fn remaining(&self) -> Option<Duration> {
        let inner = self.lock();
        inner.deadline.map(|(deadline, _)| deadline - inner.now)
    }

    /// number of `arm` calls so far
    pub fn num_armed(&self) -> usize {
        self.lock().num_armed
    }
}

impl Timer for ManualTimer {
    fn arm(&mut self, after: Duration, reason: TimeoutReason) {
        let mut inner = self.lock();
        let deadline = inner.now + after;
        inner.deadline = Some((deadline, reason));
        inner.expired.clear();
        inner.num_armed += 1;
    }

    fn disarm(&mut self) {
        let mut inner = self.lock();
        inner.deadline = None;
        inner.expired.clear();
    }

    fn poll_expired(&mut self) -> Option<TimeoutReason> {
        self.lock().expired.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_at_deadline() {
        let mut timer = ManualTimer::new();
        timer.arm(Duration::from_millis(1000), TimeoutReason::AckWait);
        assert_eq!(timer.remaining(), Some(Duration::from_millis(1000)));

        timer.advance(Duration::from_millis(999));
        assert_eq!(timer.poll_expired(), None);

        timer.advance(Duration::from_millis(1));
        assert!(!timer.is_armed());
        assert_eq!(timer.poll_expired(), Some(TimeoutReason::AckWait));
        assert_eq!(timer.poll_expired(), None);
    }

    #[test]
    fn test_disarm_and_rearm_discard_queued_expiry() {
        let mut timer = ManualTimer::new();
        let handle = timer.clone();

        timer.arm(Duration::from_millis(10), TimeoutReason::AckWait);
        handle.fire();
        timer.disarm();
        assert_eq!(timer.poll_expired(), None);

        timer.arm(Duration::from_millis(10), TimeoutReason::AckWait);
        handle.fire();
        timer.arm(Duration::from_millis(10), TimeoutReason::AckWait);
        assert_eq!(timer.poll_expired(), None);
        assert_eq!(handle.num_armed(), 3);
        assert_eq!(handle.now(), Duration::from_millis(20));
    }
}
