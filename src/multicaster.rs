// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Drains the pending-send queue while the token is held, stamping
//! sequence numbers and writing each message into the sorted buffer
//! before it goes out on the wire.

use crate::buffer::SortedBuffer;
use crate::node::{NodeId, RingId};
use crate::queue::FifoQueue;
use crate::wire::McastMessage;

/// A message queued by the application, not yet stamped with a sequence
/// number.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub guarantee: u32,
    pub payload: Vec<u8>,
}

/// Stateless multicast-draining logic. `token_seq` and `buffer` are
/// mutated in place; the wire-encoded messages transmitted this rotation
/// are returned for the caller to pass through [`crate::codec::FrameCodec`]
/// and onto the transport.
pub struct Multicaster;

impl Multicaster {
    /// Drain up to `transmits_allowed` messages from `queue`. For each:
    /// stamp `seq = token_seq + 1`, advance `token_seq`, insert the
    /// wire-encoded message into `buffer`, and collect it for
    /// transmission. Returns the encoded datagrams and the new
    /// `my_high_seq_received` value (the final stamped seq, or the
    /// passed-in value if nothing was sent).
    #[allow(clippy::too_many_arguments)]
    pub fn drain(
        queue: &mut FifoQueue<OutgoingMessage>,
        buffer: &mut SortedBuffer,
        token_seq: &mut u32,
        ring_id: RingId,
        source: NodeId,
        transmits_allowed: u32,
        my_high_seq_received: u32,
    ) -> (Vec<Vec<u8>>, u32) {
        let mut sent = Vec::new();
        let mut high_seq_received = my_high_seq_received;
        while (sent.len() as u32) < transmits_allowed {
            let Some(outgoing) = queue.pop() else {
                break;
            };
            *token_seq = token_seq.wrapping_add(1);
            let seq = *token_seq;
            let encoded = McastMessage {
                seq,
                ring_id,
                source,
                guarantee: outgoing.guarantee,
                payload: outgoing.payload,
            }
            .encode();
            // Normally fresh since seq is strictly greater than any
            // previously stamped seq on this ring, but an unreleased
            // window can still run out of room; drop rather than panic.
            if let Err(e) = buffer.insert(seq, encoded.clone()) {
                log::warn!("[multicaster] dropping stamped message seq {seq}: {e}");
                break;
            }
            sent.push(encoded);
            high_seq_received = seq;
        }
        (sent, high_seq_received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> RingId {
        RingId::new(1, 1)
    }

    #[test]
    fn stamps_sequential_seqs_and_fills_buffer() {
        let mut queue = FifoQueue::new(8);
        queue
            .push(OutgoingMessage {
                guarantee: 0,
                payload: b"one".to_vec(),
            })
            .unwrap();
        queue
            .push(OutgoingMessage {
                guarantee: 0,
                payload: b"two".to_vec(),
            })
            .unwrap();
        let mut buffer = SortedBuffer::new(16);
        let mut token_seq = 0u32;

        let (sent, high) = Multicaster::drain(&mut queue, &mut buffer, &mut token_seq, ring(), 1, 10, 0);

        assert_eq!(sent.len(), 2);
        assert_eq!(token_seq, 2);
        assert_eq!(high, 2);
        assert!(buffer.in_use(1));
        assert!(buffer.in_use(2));
    }

    #[test]
    fn stops_at_transmits_allowed() {
        let mut queue = FifoQueue::new(8);
        for _ in 0..5 {
            queue
                .push(OutgoingMessage {
                    guarantee: 0,
                    payload: vec![0],
                })
                .unwrap();
        }
        let mut buffer = SortedBuffer::new(16);
        let mut token_seq = 0u32;
        let (sent, _) = Multicaster::drain(&mut queue, &mut buffer, &mut token_seq, ring(), 1, 2, 0);
        assert_eq!(sent.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn zero_budget_sends_nothing() {
        let mut queue = FifoQueue::new(8);
        queue
            .push(OutgoingMessage {
                guarantee: 0,
                payload: vec![0],
            })
            .unwrap();
        let mut buffer = SortedBuffer::new(16);
        let mut token_seq = 5u32;
        let (sent, high) = Multicaster::drain(&mut queue, &mut buffer, &mut token_seq, ring(), 1, 0, 5);
        assert!(sent.is_empty());
        assert_eq!(token_seq, 5);
        assert_eq!(high, 5);
    }
}
