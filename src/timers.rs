// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal single-threaded timer wheel for the event loop.
//!
//! The real timer/poll abstraction is a collaborator (it decides how the
//! loop actually blocks); this module only tracks deadlines and hands
//! back which ones have expired, so the event loop can compute how long
//! to block in `mio::Poll::poll` and which handlers to run on wake.

use std::time::{Duration, Instant};

/// Opaque handle to an armed timer. Cancellation is idempotent: canceling
/// an already-fired or already-canceled handle is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Armed {
    handle: TimerHandle,
    deadline: Instant,
}

/// Tracks every armed deadline and its handle.
#[derive(Default)]
pub struct Timers {
    next_handle: u64,
    armed: Vec<Armed>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a new timer to fire after `duration`.
    pub fn arm(&mut self, duration: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.armed.push(Armed {
            handle,
            deadline: Instant::now() + duration,
        });
        handle
    }

    /// Cancel a timer by handle; idempotent.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.armed.retain(|a| a.handle != handle);
    }

    /// Cancel `handle` if present, then arm a fresh timer for `duration`.
    /// Matches the protocol's "re-arming is explicit: cancel then add".
    pub fn rearm(&mut self, handle: Option<TimerHandle>, duration: Duration) -> TimerHandle {
        if let Some(h) = handle {
            self.cancel(h);
        }
        self.arm(duration)
    }

    /// How long until the next deadline, or `None` if nothing is armed.
    /// Used to bound the `mio::Poll::poll` timeout.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.armed
            .iter()
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
            .min()
    }

    /// Remove and return every handle whose deadline has passed.
    pub fn expire(&mut self) -> Vec<TimerHandle> {
        let now = Instant::now();
        let (expired, remaining): (Vec<_>, Vec<_>) = self.armed.drain(..).partition(|a| a.deadline <= now);
        self.armed = remaining;
        expired.into_iter().map(|a| a.handle).collect()
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.armed.iter().any(|a| a.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn arm_and_expire() {
        let mut t = Timers::new();
        let h = t.arm(Duration::from_millis(1));
        sleep(Duration::from_millis(5));
        assert!(t.expire().contains(&h));
    }

    #[test]
    fn cancel_prevents_expiry() {
        let mut t = Timers::new();
        let h = t.arm(Duration::from_millis(1));
        t.cancel(h);
        sleep(Duration::from_millis(5));
        assert!(!t.expire().contains(&h));
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut t = Timers::new();
        let h = t.arm(Duration::from_millis(1));
        t.cancel(h);
        t.cancel(h);
        assert!(!t.is_armed(h));
    }

    #[test]
    fn rearm_replaces_previous_deadline() {
        let mut t = Timers::new();
        let h1 = t.arm(Duration::from_millis(1));
        let h2 = t.rearm(Some(h1), Duration::from_secs(60));
        assert!(!t.is_armed(h1));
        assert!(t.is_armed(h2));
    }

    #[test]
    fn next_timeout_reflects_soonest_deadline() {
        let mut t = Timers::new();
        t.arm(Duration::from_secs(10));
        t.arm(Duration::from_millis(1));
        let next = t.next_timeout().unwrap();
        assert!(next <= Duration::from_secs(1));
    }
}
