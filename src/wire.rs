// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire encode/decode for the four datagram payload types carried inside
//! a [`crate::codec::FrameCodec`]-protected datagram.
//!
//! Every multi-byte field is written in native byte order; receivers use
//! `endian_detector` to notice a foreign-endian peer and byte-swap. Fields
//! are encoded manually (no serde/bincode), matching the rest of this
//! codebase's wire-format modules.

use crate::error::{Error, Result};
use crate::node::{NodeId, RingId};

/// Known-constant value written into every header; `0xFF22` read back
/// byte-swapped (`0x22FF`) signals a foreign-endian sender.
pub const ENDIAN_DETECTOR: u16 = 0xFF22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    OrfToken = 0,
    Mcast = 1,
    MembJoin = 2,
    MembCommitToken = 3,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MessageType::OrfToken),
            1 => Ok(MessageType::Mcast),
            2 => Ok(MessageType::MembJoin),
            3 => Ok(MessageType::MembCommitToken),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

/// Small bounds-checked cursor over a native-endian byte buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.pos + n > self.buf.len() {
            Err(Error::Malformed(what))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, what: &'static str) -> Result<u8> {
        self.need(1, what)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16> {
        self.need(2, what)?;
        let v = u16::from_ne_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32> {
        self.need(4, what)?;
        let v = u32::from_ne_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self, what: &'static str) -> Result<u64> {
        self.need(8, what)?;
        let v = u64::from_ne_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn ring_id(&mut self, what: &'static str) -> Result<RingId> {
        let rep = self.u32(what)?;
        let seq = self.u64(what)?;
        Ok(RingId::new(rep, seq))
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn push_header(out: &mut Vec<u8>, ty: MessageType, encapsulated: u8) {
    out.push(ty as u8);
    out.push(encapsulated);
    out.extend_from_slice(&ENDIAN_DETECTOR.to_ne_bytes());
}

fn push_ring_id(out: &mut Vec<u8>, ring_id: RingId) {
    out.extend_from_slice(&ring_id.rep.to_ne_bytes());
    out.extend_from_slice(&ring_id.seq.to_ne_bytes());
}

/// Peek the message type code without fully decoding the payload.
pub fn peek_message_type(payload: &[u8]) -> Result<MessageType> {
    if payload.is_empty() {
        return Err(Error::Malformed("header"));
    }
    MessageType::from_u8(payload[0])
}

fn check_endian(detector: u16, what: &'static str) -> Result<bool> {
    if detector == ENDIAN_DETECTOR {
        Ok(false)
    } else if detector == ENDIAN_DETECTOR.swap_bytes() {
        Ok(true)
    } else {
        Err(Error::Malformed(what))
    }
}

/// A single retransmit-request list entry carried on a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrItem {
    pub ring_id: RingId,
    pub seq: u32,
}

/// Ordering/Reliability/Flow token (ORF token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrfToken {
    pub seq: u32,
    pub token_seq: u32,
    pub aru: u32,
    pub aru_addr: NodeId,
    pub ring_id: RingId,
    pub fcc: u16,
    pub retrans_flag: bool,
    pub rtr_list: Vec<RtrItem>,
}

impl OrfToken {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.rtr_list.len() * 16);
        push_header(&mut out, MessageType::OrfToken, 0);
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.token_seq.to_ne_bytes());
        out.extend_from_slice(&self.aru.to_ne_bytes());
        out.extend_from_slice(&self.aru_addr.to_ne_bytes());
        push_ring_id(&mut out, self.ring_id);
        out.extend_from_slice(&self.fcc.to_ne_bytes());
        out.extend_from_slice(&(self.retrans_flag as u32).to_ne_bytes());
        out.extend_from_slice(&(self.rtr_list.len() as u32).to_ne_bytes());
        for item in &self.rtr_list {
            push_ring_id(&mut out, item.ring_id);
            out.extend_from_slice(&item.seq.to_ne_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, bool)> {
        let mut r = Reader::new(buf);
        let _ty = r.u8("orf_token.type")?;
        let _encapsulated = r.u8("orf_token.encapsulated")?;
        let swap = check_endian(r.u16("orf_token.endian_detector")?, "orf_token.endian_detector")?;
        let seq = r.u32("orf_token.seq")?;
        let token_seq = r.u32("orf_token.token_seq")?;
        let aru = r.u32("orf_token.aru")?;
        let aru_addr = r.u32("orf_token.aru_addr")?;
        let ring_id = r.ring_id("orf_token.ring_id")?;
        let fcc = r.u16("orf_token.fcc")?;
        let retrans_flag = r.u32("orf_token.retrans_flag")? != 0;
        let entries = r.u32("orf_token.rtr_list_entries")? as usize;
        let mut rtr_list = Vec::with_capacity(entries);
        for _ in 0..entries {
            let ring_id = r.ring_id("orf_token.rtr_item.ring_id")?;
            let seq = r.u32("orf_token.rtr_item.seq")?;
            rtr_list.push(RtrItem { ring_id, seq });
        }
        Ok((
            Self {
                seq,
                token_seq,
                aru,
                aru_addr,
                ring_id,
                fcc,
                retrans_flag,
                rtr_list,
            },
            swap,
        ))
    }
}

/// A user multicast message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastMessage {
    pub seq: u32,
    pub ring_id: RingId,
    pub source: NodeId,
    pub guarantee: u32,
    pub payload: Vec<u8>,
}

impl McastMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.payload.len());
        push_header(&mut out, MessageType::Mcast, 0);
        out.extend_from_slice(&self.seq.to_ne_bytes());
        push_ring_id(&mut out, self.ring_id);
        out.extend_from_slice(&self.source.to_ne_bytes());
        out.extend_from_slice(&self.guarantee.to_ne_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, bool)> {
        let mut r = Reader::new(buf);
        let _ty = r.u8("mcast.type")?;
        let _encapsulated = r.u8("mcast.encapsulated")?;
        let swap = check_endian(r.u16("mcast.endian_detector")?, "mcast.endian_detector")?;
        let seq = r.u32("mcast.seq")?;
        let ring_id = r.ring_id("mcast.ring_id")?;
        let source = r.u32("mcast.source")?;
        let guarantee = r.u32("mcast.guarantee")?;
        let payload = r.remaining().to_vec();
        Ok((
            Self {
                seq,
                ring_id,
                source,
                guarantee,
                payload,
            },
            swap,
        ))
    }
}

/// Membership join/attempt-join message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembJoin {
    pub ring_seq: u64,
    pub proc_list: Vec<NodeId>,
    pub failed_list: Vec<NodeId>,
}

impl MembJoin {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + (self.proc_list.len() + self.failed_list.len()) * 4);
        push_header(&mut out, MessageType::MembJoin, 0);
        out.extend_from_slice(&(self.proc_list.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(self.failed_list.len() as u32).to_ne_bytes());
        out.extend_from_slice(&self.ring_seq.to_ne_bytes());
        for id in &self.proc_list {
            out.extend_from_slice(&id.to_ne_bytes());
        }
        for id in &self.failed_list {
            out.extend_from_slice(&id.to_ne_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, bool)> {
        let mut r = Reader::new(buf);
        let _ty = r.u8("memb_join.type")?;
        let _encapsulated = r.u8("memb_join.encapsulated")?;
        let swap = check_endian(r.u16("memb_join.endian_detector")?, "memb_join.endian_detector")?;
        let proc_entries = r.u32("memb_join.proc_list_entries")? as usize;
        let failed_entries = r.u32("memb_join.failed_list_entries")? as usize;
        let ring_seq = r.u64("memb_join.ring_seq")?;
        let mut proc_list = Vec::with_capacity(proc_entries);
        for _ in 0..proc_entries {
            proc_list.push(r.u32("memb_join.proc_list[i]")?);
        }
        let mut failed_list = Vec::with_capacity(failed_entries);
        for _ in 0..failed_entries {
            failed_list.push(r.u32("memb_join.failed_list[i]")?);
        }
        Ok((
            Self {
                ring_seq,
                proc_list,
                failed_list,
            },
            swap,
        ))
    }
}

/// Per-member entry carried inside a [`MembCommitToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitMemb {
    pub ring_id: RingId,
    pub aru: u32,
    pub high_delivered: u32,
    pub received_flag: bool,
}

/// Commit-phase token: proposes a new ring membership and carries each
/// member's recovery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembCommitToken {
    pub token_seq: u32,
    pub ring_id: RingId,
    pub retrans_flag: bool,
    pub memb_index: u32,
    pub addr_list: Vec<NodeId>,
    pub memb_list: Vec<CommitMemb>,
}

impl MembCommitToken {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.addr_list.len() * 4 + self.memb_list.len() * 20);
        push_header(&mut out, MessageType::MembCommitToken, 0);
        out.extend_from_slice(&self.token_seq.to_ne_bytes());
        push_ring_id(&mut out, self.ring_id);
        out.extend_from_slice(&(self.retrans_flag as u32).to_ne_bytes());
        out.extend_from_slice(&self.memb_index.to_ne_bytes());
        out.extend_from_slice(&(self.addr_list.len() as u32).to_ne_bytes());
        for id in &self.addr_list {
            out.extend_from_slice(&id.to_ne_bytes());
        }
        for m in &self.memb_list {
            push_ring_id(&mut out, m.ring_id);
            out.extend_from_slice(&m.aru.to_ne_bytes());
            out.extend_from_slice(&m.high_delivered.to_ne_bytes());
            out.extend_from_slice(&(m.received_flag as u32).to_ne_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, bool)> {
        let mut r = Reader::new(buf);
        let _ty = r.u8("memb_commit_token.type")?;
        let _encapsulated = r.u8("memb_commit_token.encapsulated")?;
        let swap = check_endian(
            r.u16("memb_commit_token.endian_detector")?,
            "memb_commit_token.endian_detector",
        )?;
        let token_seq = r.u32("memb_commit_token.token_seq")?;
        let ring_id = r.ring_id("memb_commit_token.ring_id")?;
        let retrans_flag = r.u32("memb_commit_token.retrans_flag")? != 0;
        let memb_index = r.u32("memb_commit_token.memb_index")?;
        let addr_entries = r.u32("memb_commit_token.addr_entries")? as usize;
        let mut addr_list = Vec::with_capacity(addr_entries);
        for _ in 0..addr_entries {
            addr_list.push(r.u32("memb_commit_token.addr[i]")?);
        }
        let mut memb_list = Vec::with_capacity(addr_entries);
        for _ in 0..addr_entries {
            let ring_id = r.ring_id("memb_commit_token.memb[i].ring_id")?;
            let aru = r.u32("memb_commit_token.memb[i].aru")?;
            let high_delivered = r.u32("memb_commit_token.memb[i].high_delivered")?;
            let received_flag = r.u32("memb_commit_token.memb[i].received_flg")? != 0;
            memb_list.push(CommitMemb {
                ring_id,
                aru,
                high_delivered,
                received_flag,
            });
        }
        Ok((
            Self {
                token_seq,
                ring_id,
                retrans_flag,
                memb_index,
                addr_list,
                memb_list,
            },
            swap,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orf_token_round_trip() {
        let token = OrfToken {
            seq: 10,
            token_seq: 3,
            aru: 9,
            aru_addr: 2,
            ring_id: RingId::new(1, 5),
            fcc: 4,
            retrans_flag: false,
            rtr_list: vec![RtrItem {
                ring_id: RingId::new(1, 5),
                seq: 8,
            }],
        };
        let encoded = token.encode();
        let (decoded, swap) = OrfToken::decode(&encoded).unwrap();
        assert!(!swap);
        assert_eq!(decoded, token);
    }

    #[test]
    fn mcast_round_trip_with_payload() {
        let msg = McastMessage {
            seq: 42,
            ring_id: RingId::new(7, 1),
            source: 7,
            guarantee: 0,
            payload: b"hello totem".to_vec(),
        };
        let encoded = msg.encode();
        let (decoded, _) = McastMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn memb_join_round_trip() {
        let join = MembJoin {
            ring_seq: 99,
            proc_list: vec![1, 2, 3],
            failed_list: vec![2],
        };
        let encoded = join.encode();
        let (decoded, _) = MembJoin::decode(&encoded).unwrap();
        assert_eq!(decoded, join);
    }

    #[test]
    fn commit_token_round_trip() {
        let token = MembCommitToken {
            token_seq: 1,
            ring_id: RingId::new(1, 8),
            retrans_flag: true,
            memb_index: 0,
            addr_list: vec![1, 2],
            memb_list: vec![
                CommitMemb {
                    ring_id: RingId::new(1, 4),
                    aru: 10,
                    high_delivered: 10,
                    received_flag: true,
                },
                CommitMemb {
                    ring_id: RingId::new(2, 4),
                    aru: 9,
                    high_delivered: 9,
                    received_flag: false,
                },
            ],
        };
        let encoded = token.encode();
        let (decoded, _) = MembCommitToken::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let token = OrfToken {
            seq: 1,
            token_seq: 1,
            aru: 0,
            aru_addr: 1,
            ring_id: RingId::new(1, 1),
            fcc: 0,
            retrans_flag: false,
            rtr_list: vec![],
        };
        let mut encoded = token.encode();
        encoded.truncate(encoded.len() - 4);
        assert!(OrfToken::decode(&encoded).is_err());
    }

    #[test]
    fn foreign_endian_detected() {
        let mut encoded = McastMessage {
            seq: 1,
            ring_id: RingId::new(1, 1),
            source: 1,
            guarantee: 0,
            payload: vec![],
        }
        .encode();
        encoded[2..4].swap(0, 1);
        let (_, swap) = McastMessage::decode(&encoded).unwrap();
        assert!(swap);
    }

    #[test]
    fn peek_type_matches_encoded() {
        let encoded = MembJoin {
            ring_seq: 0,
            proc_list: vec![],
            failed_list: vec![],
        }
        .encode();
        assert_eq!(peek_message_type(&encoded).unwrap(), MessageType::MembJoin);
    }
}
