//! Keepalive policy for established connections.
//!
//! [`Keepalive`] is a small state machine driven by the connection handler. It owns
//! no timer: the handler calls [`Keepalive::poll`] whenever it wakes up (data arrived
//! or [`Keepalive::deadline`] passed) and acts on the returned [`KeepaliveAction`].
//!
//! One cycle lasts `interval`. When a cycle elapses and no ping is outstanding, a
//! ping is due. When a cycle elapses while the ping is still unanswered, the cycle
//! counts as missed. Once `max_missed` cycles have been missed, the next elapsed
//! cycle expires the connection. A pong resets the count.
//!
//! ```
//! use pingpong_core::keepalive::{Keepalive, KeepaliveAction};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let start = Instant::now();
//! let second = Duration::from_secs(1);
//! let mut keepalive = Keepalive::new(second, 1, start);
//!
//! assert_eq!(keepalive.poll(start), KeepaliveAction::Idle);
//! assert_eq!(keepalive.poll(start + second), KeepaliveAction::SendPing);
//! assert_eq!(keepalive.poll(start + second * 2), KeepaliveAction::Idle); // missed 1
//! assert_eq!(keepalive.poll(start + second * 3), KeepaliveAction::Expired);
//! ```

use std::time::Duration;
use tokio::time::Instant;

/// What the handler must do after a [`Keepalive::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Nothing to do.
    Idle,
    /// Send a ping to the peer.
    SendPing,
    /// The peer is presumed dead; close the connection.
    Expired,
}

/// Per-connection ping/pong bookkeeping.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Duration,
    max_missed: u32,
    cycle_start: Instant,
    awaiting_pong: bool,
    missed_pongs: u32,
}

impl Keepalive {
    /// Starts the first cycle at `now`.
    pub fn new(interval: Duration, max_missed: u32, now: Instant) -> Self {
        Self {
            interval,
            max_missed,
            cycle_start: now,
            awaiting_pong: false,
            missed_pongs: 0,
        }
    }

    /// When the current cycle ends.
    pub fn deadline(&self) -> Instant {
        self.cycle_start + self.interval
    }

    /// Advances the state machine to `now`.
    ///
    /// Nothing happens until the current cycle has elapsed, so calling this on
    /// every wake-up is safe regardless of how often the handler wakes.
    pub fn poll(&mut self, now: Instant) -> KeepaliveAction {
        if now.saturating_duration_since(self.cycle_start) < self.interval {
            return KeepaliveAction::Idle;
        }

        if !self.awaiting_pong {
            self.awaiting_pong = true;
            self.cycle_start = now;
            KeepaliveAction::SendPing
        } else if self.missed_pongs < self.max_missed {
            self.missed_pongs += 1;
            self.cycle_start = now;
            KeepaliveAction::Idle
        } else {
            KeepaliveAction::Expired
        }
    }

    /// Records a pong from the peer.
    pub fn pong_received(&mut self) {
        self.awaiting_pong = false;
        self.missed_pongs = 0;
    }

    /// Whether a ping is outstanding.
    pub fn awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// Cycles missed since the outstanding ping was sent.
    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs
    }
}
