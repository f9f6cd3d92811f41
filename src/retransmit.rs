// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Two-phase retransmit handling performed on every token rotation:
//! service other nodes' requests from our own buffer, then report our own
//! gaps back onto the token for someone else to fill.

use crate::buffer::SortedBuffer;
use crate::node::RingId;
use crate::wire::RtrItem;

/// Stateless retransmit logic operating on a token's `rtr_list` in place.
pub struct RetransmitEngine;

impl RetransmitEngine {
    /// Phase 1: for each entry addressed to `my_ring_id` that this node
    /// can satisfy from `buffer`, return the stored datagram for
    /// remulticast and drop the entry from `rtr_list`. Stops after
    /// `transmits_allowed` datagrams are collected.
    ///
    /// Entries for foreign rings, or for sequences this node doesn't
    /// have, are left in the list for someone else (or a later rotation).
    pub fn service_requests(
        rtr_list: &mut Vec<RtrItem>,
        my_ring_id: RingId,
        buffer: &SortedBuffer,
        transmits_allowed: u32,
    ) -> Vec<Vec<u8>> {
        let mut serviced = Vec::new();
        let mut remaining = Vec::with_capacity(rtr_list.len());
        for item in rtr_list.drain(..) {
            if serviced.len() as u32 >= transmits_allowed || item.ring_id != my_ring_id {
                remaining.push(item);
                continue;
            }
            match buffer.get(item.seq) {
                Some(payload) => serviced.push(payload.to_vec()),
                None => remaining.push(item),
            }
        }
        *rtr_list = remaining;
        serviced
    }

    /// Phase 2: append every seq in `(my_aru, my_high_seq_received]` that
    /// `buffer` does not hold and that isn't already in `rtr_list`, up to
    /// `capacity` total entries.
    pub fn add_local_gaps(
        rtr_list: &mut Vec<RtrItem>,
        my_ring_id: RingId,
        my_aru: u32,
        my_high_seq_received: u32,
        buffer: &SortedBuffer,
        capacity: usize,
    ) {
        if rtr_list.len() >= capacity {
            return;
        }
        let mut seq = my_aru.wrapping_add(1);
        while seq <= my_high_seq_received && rtr_list.len() < capacity {
            let already_listed = rtr_list.iter().any(|e| e.ring_id == my_ring_id && e.seq == seq);
            if !buffer.in_use(seq) && !already_listed {
                rtr_list.push(RtrItem {
                    ring_id: my_ring_id,
                    seq,
                });
            }
            seq = seq.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> RingId {
        RingId::new(1, 1)
    }

    #[test]
    fn services_matching_entries_from_buffer() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, vec![0xAA]).unwrap();
        let mut rtr = vec![RtrItem {
            ring_id: ring(),
            seq: 1,
        }];
        let serviced = RetransmitEngine::service_requests(&mut rtr, ring(), &buf, 10);
        assert_eq!(serviced, vec![vec![0xAA]]);
        assert!(rtr.is_empty());
    }

    #[test]
    fn leaves_unsatisfiable_entries_in_place() {
        let buf = SortedBuffer::new(8);
        let mut rtr = vec![RtrItem {
            ring_id: ring(),
            seq: 1,
        }];
        let serviced = RetransmitEngine::service_requests(&mut rtr, ring(), &buf, 10);
        assert!(serviced.is_empty());
        assert_eq!(rtr.len(), 1);
    }

    #[test]
    fn foreign_ring_entries_are_untouched() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, vec![1]).unwrap();
        let foreign = RingId::new(2, 1);
        let mut rtr = vec![RtrItem {
            ring_id: foreign,
            seq: 1,
        }];
        let serviced = RetransmitEngine::service_requests(&mut rtr, ring(), &buf, 10);
        assert!(serviced.is_empty());
        assert_eq!(rtr.len(), 1);
    }

    #[test]
    fn stops_after_transmits_allowed() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, vec![1]).unwrap();
        buf.insert(2, vec![2]).unwrap();
        let mut rtr = vec![
            RtrItem { ring_id: ring(), seq: 1 },
            RtrItem { ring_id: ring(), seq: 2 },
        ];
        let serviced = RetransmitEngine::service_requests(&mut rtr, ring(), &buf, 1);
        assert_eq!(serviced.len(), 1);
        assert_eq!(rtr.len(), 1);
    }

    #[test]
    fn adds_gaps_not_held_and_not_already_listed() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(2, vec![2]).unwrap();
        let mut rtr = Vec::new();
        RetransmitEngine::add_local_gaps(&mut rtr, ring(), 0, 3, &buf, 30);
        // seq 2 is held, so only 1 and 3 should be reported missing.
        let seqs: Vec<u32> = rtr.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn respects_capacity() {
        let buf = SortedBuffer::new(64);
        let mut rtr = Vec::new();
        RetransmitEngine::add_local_gaps(&mut rtr, ring(), 0, 100, &buf, 3);
        assert_eq!(rtr.len(), 3);
    }

    #[test]
    fn skips_gaps_already_in_list() {
        let buf = SortedBuffer::new(8);
        let mut rtr = vec![RtrItem { ring_id: ring(), seq: 1 }];
        RetransmitEngine::add_local_gaps(&mut rtr, ring(), 0, 2, &buf, 30);
        let seqs: Vec<u32> = rtr.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
