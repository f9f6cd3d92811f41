// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Walks the sorted buffer in sequence order and hands contiguous
//! messages to the application, stopping at the first hole.

use crate::buffer::SortedBuffer;
use crate::node::NodeId;
use crate::wire::McastMessage;

/// A message ready for delivery to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub source: NodeId,
    pub payload: Vec<u8>,
    pub endian_swap_required: bool,
}

/// Tracks `high_seq_delivered` and drains contiguous messages from a
/// [`SortedBuffer`].
#[derive(Debug, Default)]
pub struct DeliveryEngine {
    high_seq_delivered: u32,
}

impl DeliveryEngine {
    pub fn new(high_seq_delivered: u32) -> Self {
        Self { high_seq_delivered }
    }

    pub fn high_seq_delivered(&self) -> u32 {
        self.high_seq_delivered
    }

    pub fn set_high_seq_delivered(&mut self, value: u32) {
        self.high_seq_delivered = value;
    }

    /// Deliver every contiguously-held message above `high_seq_delivered`,
    /// decoding each stored datagram as an [`McastMessage`] and stopping
    /// at the first hole or decode failure. Messages that fail to decode
    /// are treated as a hole (they indicate corruption upstream of this
    /// stage and must not be silently skipped).
    pub fn drain(&mut self, buffer: &SortedBuffer) -> Vec<Delivered> {
        let mut out = Vec::new();
        loop {
            let next = self.high_seq_delivered.wrapping_add(1);
            let Some(raw) = buffer.get(next) else {
                break;
            };
            let Ok((msg, swap)) = McastMessage::decode(raw) else {
                break;
            };
            out.push(Delivered {
                source: msg.source,
                payload: msg.payload,
                endian_swap_required: swap,
            });
            self.high_seq_delivered = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::RingId;

    fn stamped(seq: u32, source: NodeId, payload: &[u8]) -> Vec<u8> {
        McastMessage {
            seq,
            ring_id: RingId::new(1, 1),
            source,
            guarantee: 0,
            payload: payload.to_vec(),
        }
        .encode()
    }

    #[test]
    fn delivers_contiguous_run_in_order() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, stamped(1, 1, b"a")).unwrap();
        buf.insert(2, stamped(2, 1, b"b")).unwrap();
        buf.insert(4, stamped(4, 1, b"d")).unwrap();

        let mut engine = DeliveryEngine::new(0);
        let delivered = engine.drain(&buf);
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].payload, b"a");
        assert_eq!(delivered[1].payload, b"b");
        assert_eq!(engine.high_seq_delivered(), 2);
    }

    #[test]
    fn stops_at_first_hole() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, stamped(1, 1, b"a")).unwrap();
        let mut engine = DeliveryEngine::new(0);
        assert_eq!(engine.drain(&buf).len(), 1);
        assert_eq!(engine.drain(&buf).len(), 0);
    }

    #[test]
    fn never_redelivers_a_message() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, stamped(1, 1, b"a")).unwrap();
        let mut engine = DeliveryEngine::new(0);
        engine.drain(&buf);
        buf.insert(2, stamped(2, 1, b"b")).unwrap();
        let second = engine.drain(&buf);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload, b"b");
    }
}
