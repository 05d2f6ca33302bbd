//! Timer management for the production runner.
//!
//! Provides a tokio-based timer implementation for the deterministic
//! state machine. Timers are spawned as tokio tasks and can be cancelled.
//! Stale timers that fire anyway are filtered by the state machine via
//! their (height, round, step) coordinates, so cancellation here is an
//! optimization, not a correctness requirement.

use palisade_core::{Event, TimeoutStep, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Manages timers for the production runner.
///
/// Each timer is a tokio task that sleeps for the specified duration and
/// then sends the appropriate timer event to the event channel.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        TimerManager {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Schedule a consensus step timeout.
    ///
    /// If a timer with the same coordinates already exists, it is
    /// cancelled first.
    pub fn schedule(&mut self, height: u64, round: u32, step: TimeoutStep, duration: Duration) {
        let id = TimerId::Step {
            height,
            round,
            step,
        };
        self.cancel(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(height, round, ?step, "timer fired");
            let _ = event_tx
                .send(Event::TimeoutElapsed {
                    height,
                    round,
                    step,
                })
                .await;
        });
        self.timers.insert(id, handle);
        debug!(height, round, ?step, ?duration, "timer set");

        // Timers for committed heights can never fire usefully.
        self.timers.retain(|id, handle| match id {
            TimerId::Step { height: h, .. } if *h + 1 < height => {
                handle.abort();
                false
            }
            _ => true,
        });
    }

    /// Cancel a timer. No-op if it does not exist or already fired.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    /// Cancel all timers. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
