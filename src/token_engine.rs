// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Token rotation bookkeeping: token-seq deduplication, failure
//! detection via stuck ARU, and the representative's quiesce (token
//! hold) optimization.
//!
//! This module makes the *decisions*; the event loop (see
//! [`crate::instance`]) owns the sockets and actually forwards, holds,
//! or retransmits the encoded token.

use crate::node::NodeId;

/// Per-ring bookkeeping the token engine owns across rotations.
#[derive(Debug, Default)]
pub struct TokenEngine {
    /// `None` until the first token is observed, per the "no token
    /// observed" sentinel semantics (the source used `-1` with signed
    /// comparison; here the sentinel is explicit).
    my_token_seq: Option<u32>,
    my_seq_unchanged: u32,
    last_seen_token_seq_value: u32,
    my_aru_count: u32,
    last_seen_aru: u32,
    last_seen_aru_addr: NodeId,
}

impl TokenEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn my_token_seq(&self) -> Option<u32> {
        self.my_token_seq
    }

    /// Classify an incoming token's `token_seq` against what we've seen
    /// so far. The very first token observed is always accepted,
    /// regardless of its `token_seq` value.
    pub fn check_token_seq(&self, incoming_token_seq: u32) -> bool {
        match self.my_token_seq {
            None => true,
            Some(seen) => incoming_token_seq > seen,
        }
    }

    /// Record that `token_seq` has now been observed.
    pub fn observe_token_seq(&mut self, token_seq: u32) {
        self.my_token_seq = Some(token_seq);
    }

    /// Update the quiesce counter: increments while the token's `seq`
    /// field (highest message seq ever carried) stays unchanged across
    /// rotations, resets the moment new messages flow.
    pub fn update_seq_unchanged(&mut self, token_seq_field: u32) {
        if token_seq_field == self.last_seen_token_seq_value {
            self.my_seq_unchanged += 1;
        } else {
            self.my_seq_unchanged = 0;
            self.last_seen_token_seq_value = token_seq_field;
        }
    }

    /// Whether the representative should hold the token this rotation
    /// rather than forward it (ring quiesced).
    pub fn should_hold_token(&self, is_representative: bool, seqno_unchanged_const: u32) -> bool {
        is_representative && self.my_seq_unchanged >= seqno_unchanged_const
    }

    /// Track consecutive tokens reporting the same `(aru, aru_addr)`.
    /// Returns `true` once `fail_to_recv_const` consecutive rotations
    /// have reported no progress, signaling the caller should declare
    /// `aru_addr` failed and re-enter Gather.
    pub fn observe_aru(&mut self, token_aru: u32, token_aru_addr: NodeId, fail_to_recv_const: u32) -> bool {
        if token_aru == self.last_seen_aru && token_aru_addr == self.last_seen_aru_addr {
            self.my_aru_count += 1;
        } else {
            self.my_aru_count = 0;
            self.last_seen_aru = token_aru;
            self.last_seen_aru_addr = token_aru_addr;
        }
        self.my_aru_count >= fail_to_recv_const
    }

    pub fn reset_aru_tracking(&mut self) {
        self.my_aru_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_token_always_accepted() {
        let engine = TokenEngine::new();
        assert!(engine.check_token_seq(0));
        assert!(engine.check_token_seq(u32::MAX));
    }

    #[test]
    fn rejects_non_increasing_token_seq() {
        let mut engine = TokenEngine::new();
        engine.observe_token_seq(5);
        assert!(!engine.check_token_seq(5));
        assert!(!engine.check_token_seq(4));
        assert!(engine.check_token_seq(6));
    }

    #[test]
    fn quiesce_counter_resets_on_seq_change() {
        let mut engine = TokenEngine::new();
        for _ in 0..5 {
            engine.update_seq_unchanged(10);
        }
        assert_eq!(engine.my_seq_unchanged, 4);
        engine.update_seq_unchanged(11);
        assert_eq!(engine.my_seq_unchanged, 0);
    }

    #[test]
    fn holds_token_only_when_representative_and_quiesced() {
        let mut engine = TokenEngine::new();
        for _ in 0..20 {
            engine.update_seq_unchanged(10);
        }
        assert!(engine.should_hold_token(true, 20));
        assert!(!engine.should_hold_token(false, 20));
    }

    #[test]
    fn aru_stuck_detection_fires_after_threshold() {
        let mut engine = TokenEngine::new();
        let mut fired = false;
        for _ in 0..250 {
            fired = engine.observe_aru(7, 2, 250);
        }
        assert!(fired);
    }

    #[test]
    fn aru_progress_resets_stuck_counter() {
        let mut engine = TokenEngine::new();
        for _ in 0..100 {
            engine.observe_aru(7, 2, 250);
        }
        assert!(!engine.observe_aru(8, 2, 250));
    }
}
