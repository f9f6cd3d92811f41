// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ring configuration — single source of truth for every tunable the core
//! reads. Static defaults live as associated constants on [`RingConfig`];
//! per-node values (identity, network binding, key material) are supplied
//! by the caller.

use crate::error::{Error, Result};
use crate::node::NodeId;
use std::net::Ipv4Addr;

// =======================================================================
// Timer defaults (milliseconds)
// =======================================================================

/// Token-loss deadline measured from last token reception.
pub const DEFAULT_TOKEN_TIMEOUT_MS: u32 = 1000;
/// Per-hop token retransmit interval; does not itself count as loss.
pub const DEFAULT_TOKEN_RETRANSMIT_MS: u32 = 200;
/// Minimum time spent in Gather re-broadcasting join messages.
pub const DEFAULT_GATHER_JOIN_MS: u32 = 100;
/// Deadline for consensus to be reached while in Gather.
pub const DEFAULT_GATHER_CONSENSUS_MS: u32 = 200;
/// Deadline for the Commit state before falling back to Gather.
pub const DEFAULT_COMMIT_MS: u32 = 100;

// =======================================================================
// Protocol constants
// =======================================================================

/// Consecutive identical-seq tokens before the representative holds the
/// token instead of forwarding it (ring quiesced).
pub const DEFAULT_SEQNO_UNCHANGED_CONST: u32 = 20;
/// Consecutive tokens with unchanged aru/aru_addr pointing at us before we
/// declare `aru_addr` failed.
pub const DEFAULT_FAIL_TO_RECV_CONST: u32 = 250;
/// Maximum gap between `my_aru` and `token.seq` before new multicasts brake.
pub const DEFAULT_MISSING_MCAST_WINDOW: u32 = 128;
/// Capacity of the retransmit-request list carried on the token.
pub const DEFAULT_RETRANSMIT_ENTRIES_MAX: usize = 30;
/// Group-wide flow-control window (multicasts + remulticasts per rotation).
pub const DEFAULT_WINDOW: u32 = 50;
/// Per-node sub-window (reserved for future per-node fairness use).
pub const DEFAULT_SUB_WINDOW: u32 = 32;

/// Default multicast port used by the demo binary and tests.
pub const DEFAULT_MCAST_PORT: u16 = 5405;

/// Capacity of [`crate::buffer::SortedBuffer`]; must be a power of two.
pub const DEFAULT_SORTEDBUFFER_CAPACITY: usize = 4096;
/// Capacity of the pending-send [`crate::queue::FifoQueue`].
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1024;

/// Configuration for a single [`crate::instance::RingInstance`].
///
/// Every field here corresponds to a named knob; numeric fields default to
/// the values above via [`RingConfig::default`].
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// This node's identity on the ring. Must be non-zero.
    pub node_id: NodeId,
    /// Multicast group address for message/token traffic.
    pub mcast_addr: Ipv4Addr,
    /// Multicast group port.
    pub mcast_port: u16,
    /// Local interface to bind and join multicast on; `None` autodetects.
    pub bind_iface: Option<Ipv4Addr>,
    /// Shared secret used to derive the FrameCodec's per-frame keys.
    pub private_key: Vec<u8>,
    /// Path to the persisted ring-sequence file for this node.
    pub persist_path: std::path::PathBuf,

    pub token_timeout_ms: u32,
    pub token_retransmit_ms: u32,
    pub gather_join_ms: u32,
    pub gather_consensus_ms: u32,
    pub commit_ms: u32,
    pub seqno_unchanged_const: u32,
    pub fail_to_recv_const: u32,
    pub missing_mcast_window: u32,
    pub retransmit_entries_max: usize,
    pub window: u32,
    pub sub_window: u32,
    pub sortedbuffer_capacity: usize,
    pub send_queue_capacity: usize,
}

impl RingConfig {
    /// Construct a config with every default applied except identity,
    /// network address, key, and persistence path, which the caller must
    /// always supply explicitly.
    pub fn new(
        node_id: NodeId,
        mcast_addr: Ipv4Addr,
        private_key: Vec<u8>,
        persist_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            node_id,
            mcast_addr,
            mcast_port: DEFAULT_MCAST_PORT,
            bind_iface: None,
            private_key,
            persist_path: persist_path.into(),
            token_timeout_ms: DEFAULT_TOKEN_TIMEOUT_MS,
            token_retransmit_ms: DEFAULT_TOKEN_RETRANSMIT_MS,
            gather_join_ms: DEFAULT_GATHER_JOIN_MS,
            gather_consensus_ms: DEFAULT_GATHER_CONSENSUS_MS,
            commit_ms: DEFAULT_COMMIT_MS,
            seqno_unchanged_const: DEFAULT_SEQNO_UNCHANGED_CONST,
            fail_to_recv_const: DEFAULT_FAIL_TO_RECV_CONST,
            missing_mcast_window: DEFAULT_MISSING_MCAST_WINDOW,
            retransmit_entries_max: DEFAULT_RETRANSMIT_ENTRIES_MAX,
            window: DEFAULT_WINDOW,
            sub_window: DEFAULT_SUB_WINDOW,
            sortedbuffer_capacity: DEFAULT_SORTEDBUFFER_CAPACITY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }

    /// Validate cross-field invariants before a [`crate::instance::RingInstance`]
    /// is constructed from this config.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(Error::InvalidConfig("node_id must be non-zero".into()));
        }
        if !self.sortedbuffer_capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "sortedbuffer_capacity must be a power of two".into(),
            ));
        }
        if self.retransmit_entries_max == 0 {
            return Err(Error::InvalidConfig(
                "retransmit_entries_max must be > 0".into(),
            ));
        }
        if self.window == 0 {
            return Err(Error::InvalidConfig("window must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> RingConfig {
        RingConfig::new(1, Ipv4Addr::new(239, 2, 11, 1), vec![0xAB; 16], "/tmp/totem-test.seq")
    }

    #[test]
    fn defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn zero_node_id_rejected() {
        let mut cfg = base_config();
        cfg.node_id = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_power_of_two_capacity_rejected() {
        let mut cfg = base_config();
        cfg.sortedbuffer_capacity = 100;
        assert!(cfg.validate().is_err());
    }
}
