//! Timer registry
//!
//! All call timers are keyed by purpose and owned by one registry, so every
//! transition out of the state that armed a timer can cancel it explicitly.
//! Expiries carry the session generation captured at arm time; the
//! orchestrator drops expiries whose generation no longer matches, which
//! makes callbacks of a superseded session provably inert even if the abort
//! races the firing.

use crate::types::{
    ANSWER_TIMEOUT, DURATION_TICK, FAILED_RESET_DELAY, RECONNECT_DELAY, RING_TIMEOUT,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Purpose of a call timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Caller-side wait for an answer (single-shot, non-fatal on expiry)
    AnswerTimeout,
    /// Callee-side auto-decline for an unanswered ring (single-shot)
    RingTimeout,
    /// Wait before requesting an ICE restart (single-shot)
    ReconnectDelay,
    /// Call-duration ticker while connected (periodic)
    DurationTick,
    /// Grace period before a failed session resets to idle (single-shot)
    FailedReset,
}

impl TimerKind {
    /// The duration this timer runs for (or ticks at, if periodic)
    pub fn duration(&self) -> Duration {
        match self {
            Self::AnswerTimeout => ANSWER_TIMEOUT,
            Self::RingTimeout => RING_TIMEOUT,
            Self::ReconnectDelay => RECONNECT_DELAY,
            Self::DurationTick => DURATION_TICK,
            Self::FailedReset => FAILED_RESET_DELAY,
        }
    }

    /// Whether this timer fires repeatedly until cancelled
    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::DurationTick)
    }
}

/// A fired timer, tagged with the session generation it was armed under
#[derive(Debug, Clone, Copy)]
pub struct TimerExpiry {
    /// Which timer fired
    pub kind: TimerKind,
    /// Session generation at arm time
    pub generation: u64,
}

/// Registry of armed call timers, keyed by purpose
pub struct TimerRegistry {
    tx: mpsc::UnboundedSender<TimerExpiry>,
    armed: HashMap<TimerKind, JoinHandle<()>>,
}

impl TimerRegistry {
    /// Create a registry and the receiver its expiries arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                armed: HashMap::new(),
            },
            rx,
        )
    }

    /// Arm a timer, replacing any timer of the same kind
    pub fn arm(&mut self, kind: TimerKind, generation: u64) {
        self.cancel(kind);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            if kind.is_periodic() {
                let mut interval = tokio::time::interval(kind.duration());
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick of a tokio interval completes immediately.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if tx.send(TimerExpiry { kind, generation }).is_err() {
                        return;
                    }
                }
            } else {
                tokio::time::sleep(kind.duration()).await;
                let _ = tx.send(TimerExpiry { kind, generation });
            }
        });
        self.armed.insert(kind, handle);
    }

    /// Cancel a timer if armed
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(handle) = self.armed.remove(&kind) {
            handle.abort();
        }
    }

    /// Cancel every armed timer
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }

    /// Whether a timer of this kind is currently armed
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
