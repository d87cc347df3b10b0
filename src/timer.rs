use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Why a timer was armed. Expiries are dispatched on this by pattern matching; 'no timeout'
///  is represented by the absence of a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// the sender is waiting for the acknowledgement of its pending packet
    AckWait,
}

/// A single-shot timer whose expiries are collected in a queue rather than delivered through
///  a callback. The owner drains the queue in its own tick via [Timer::poll_expired], so timer
///  handling never runs concurrently with the rest of the protocol state machine.
pub trait Timer: Send {
    /// (Re-)arms the timer, replacing a previous schedule. Expiries of a replaced schedule that
    ///  are already queued are discarded.
    fn arm(&mut self, after: Duration, reason: TimeoutReason);

    /// Cancels the current schedule, including an expiry that is queued but not yet polled
    fn disarm(&mut self);

    fn poll_expired(&mut self) -> Option<TimeoutReason>;
}

/// [Timer] implementation based on tokio's timer: each schedule is a spawned task that sleeps
///  and then sends the reason into an mpsc channel.
///
/// NB: `arm` spawns a task, so it must be called from inside a tokio runtime
pub struct TokioTimer {
    /// identifies the current schedule - expiries for other generations are stale
    generation: u64,
    sleep_task: Option<JoinHandle<()>>,
    expired_send: mpsc::UnboundedSender<(u64, TimeoutReason)>,
    expired_recv: mpsc::UnboundedReceiver<(u64, TimeoutReason)>,
}
impl TokioTimer {
    pub fn new() -> TokioTimer {
        let (expired_send, expired_recv) = mpsc::unbounded_channel();
        TokioTimer {
            generation: 0,
            sleep_task: None,
            expired_send,
            expired_recv,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.sleep_task.is_some()
    }

    fn abort_sleep_task(&mut self) {
        if let Some(handle) = self.sleep_task.take() {
            handle.abort();
        }
    }
}
impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}
impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.abort_sleep_task();
    }
}

impl Timer for TokioTimer {
    fn arm(&mut self, after: Duration, reason: TimeoutReason) {
        self.abort_sleep_task();
        self.generation += 1;

        let generation = self.generation;
        let expired_send = self.expired_send.clone();
        // the deadline is fixed here rather than when the spawned task is first polled
        let deadline = Instant::now() + after;
        trace!("arming timer generation {} for {:?}: {:?}", generation, after, reason);

        self.sleep_task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // the receiver lives as long as the timer, and the timer aborts this task on drop
            let _ = expired_send.send((generation, reason));
        }));
    }

    fn disarm(&mut self) {
        self.abort_sleep_task();
        self.generation += 1;
    }

    fn poll_expired(&mut self) -> Option<TimeoutReason> {
        while let Ok((generation, reason)) = self.expired_recv.try_recv() {
            if generation == self.generation {
                self.sleep_task = None;
                return Some(reason);
            }
            trace!("discarding stale timer expiry of generation {}", generation);
        }
        None
    }
}
