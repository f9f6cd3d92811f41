// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event loop core: ties every ring-protocol collaborator to the two
//! non-blocking sockets and the timer wheel.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                          RingInstance                            |
//! |  +------------+   +--------------------+   +-------------------+ |
//! |  | mio::Poll  |   | DatagramTransport   |   | FrameCodec        | |
//! |  +------------+   +--------------------+   +-------------------+ |
//! |         |  mcast / token readiness                                |
//! |         v                                                        |
//! |  dispatch on message type: OrfToken | Mcast | MembJoin |          |
//! |                             MembCommitToken                      |
//! |         |                                                        |
//! |         v                                                        |
//! |  TokenEngine -> MembershipProtocol -> RetransmitEngine ->         |
//! |  Multicaster -> DeliveryEngine -> FlowControl                     |
//! +------------------------------------------------------------------+
//! ```
//!
//! Every collaborator above is owned exclusively by this struct. Nothing
//! here is shared across threads; the whole core runs on the thread that
//! calls [`RingInstance::poll_once`].

use crate::buffer::SortedBuffer;
use crate::callbacks::{CallbackHandle, CallbackRegistry, TokenCallbackKind};
use crate::codec::FrameCodec;
use crate::config::RingConfig;
use crate::delivery::{Delivered, DeliveryEngine};
use crate::error::{Error, Result};
use crate::flow_control::FlowControl;
use crate::membership::{ConfChg, MembState, MembershipProtocol};
use crate::multicaster::{Multicaster, OutgoingMessage};
use crate::node::{NodeId, RingId};
use crate::persist;
use crate::queue::FifoQueue;
use crate::retransmit::RetransmitEngine;
use crate::stats::RingStats;
use crate::timers::{TimerHandle, Timers};
use crate::token_engine::TokenEngine;
use crate::transport::{discover_interfaces, DatagramTransport, MCAST_TOKEN, UNICAST_TOKEN};
use crate::wire::{peek_message_type, CommitMemb, MembCommitToken, MembJoin, MessageType, OrfToken};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Events the event loop hands back to the caller after a poll iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingEvent {
    /// A totally-ordered message became deliverable.
    Delivered(Delivered),
    /// A membership configuration change (transitional or regular).
    MembershipChanged(ConfChg),
}

/// Delivery guarantee requested for an outbound multicast. Only `Agreed`
/// (the core's totally-ordered delivery) is implemented here; `Safe`
/// ordering belongs to a higher-level collaborator built atop this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarantee {
    Agreed = 0,
}

/// Largest plaintext payload accepted by [`RingInstance::mcast`]; the
/// packing/fragmentation layer that would split larger messages is an
/// out-of-scope collaborator.
pub const MAX_PAYLOAD_LEN: usize = 60_000;

/// The single-ring protocol core: one instance per node, per ring.
pub struct RingInstance {
    config: RingConfig,
    node_id: NodeId,

    transport: DatagramTransport,
    poll: mio::Poll,
    frame_codec: FrameCodec,

    membership: MembershipProtocol,
    token_engine: TokenEngine,
    flow_control: FlowControl,
    timers: Timers,
    callbacks: CallbackRegistry,
    stats: RingStats,

    buffer: SortedBuffer,
    recovery_buffer: SortedBuffer,
    send_queue: FifoQueue<OutgoingMessage>,
    recovery_queue: FifoQueue<OutgoingMessage>,
    delivery: DeliveryEngine,

    node_addresses: HashMap<NodeId, SocketAddr>,
    address_to_node: HashMap<SocketAddr, NodeId>,

    my_aru: u32,
    my_last_aru: u32,
    my_high_seq_received: u32,
    last_round_sent: u32,
    retrans_zero_rounds: u32,
    barrier_seq: u32,

    held_token: Option<OrfToken>,
    last_token_datagram: Option<Vec<u8>>,
    last_token_dest: Option<SocketAddr>,

    token_timeout_handle: Option<TimerHandle>,
    token_retransmit_handle: Option<TimerHandle>,
    gather_consensus_handle: Option<TimerHandle>,
    join_resend_handle: Option<TimerHandle>,
    commit_handle: Option<TimerHandle>,
}

impl RingInstance {
    /// Bind the transport, load the persisted ring sequence, and build
    /// every collaborator. Does not yet attempt to form a ring; call
    /// [`RingInstance::start`] to begin Gather.
    pub fn new(config: RingConfig) -> Result<Self> {
        config.validate()?;

        let mut transport = DatagramTransport::bind(&config)?;
        let poll = mio::Poll::new()?;
        transport.register(&poll)?;

        let ring_seq = persist::read_ring_seq(&config.persist_path)?;
        let ring_id = RingId::new(config.node_id, ring_seq);
        let membership = MembershipProtocol::new(config.node_id, ring_id);
        let flow_control = FlowControl::new(config.window, config.missing_mcast_window);
        let frame_codec = FrameCodec::new(config.private_key.clone());

        let buffer = SortedBuffer::new(config.sortedbuffer_capacity);
        let recovery_buffer = SortedBuffer::new(config.sortedbuffer_capacity);
        let send_queue = FifoQueue::new(config.send_queue_capacity);
        let recovery_queue = FifoQueue::new(config.send_queue_capacity);

        // A node always knows how to reach itself, so a single-member ring
        // can forward its token to its own successor (itself) without the
        // caller having to register a loopback address explicitly.
        let self_addr = transport.unicast_local_addr()?;
        let mut node_addresses = HashMap::new();
        let mut address_to_node = HashMap::new();
        node_addresses.insert(config.node_id, self_addr);
        address_to_node.insert(self_addr, config.node_id);

        Ok(Self {
            node_id: config.node_id,
            config,
            transport,
            poll,
            frame_codec,
            membership,
            token_engine: TokenEngine::new(),
            flow_control,
            timers: Timers::new(),
            callbacks: CallbackRegistry::new(),
            stats: RingStats::new(),
            buffer,
            recovery_buffer,
            send_queue,
            recovery_queue,
            delivery: DeliveryEngine::new(0),
            node_addresses,
            address_to_node,
            my_aru: 0,
            my_last_aru: 0,
            my_high_seq_received: 0,
            last_round_sent: 0,
            retrans_zero_rounds: 0,
            barrier_seq: 0,
            held_token: None,
            last_token_datagram: None,
            last_token_dest: None,
            token_timeout_handle: None,
            token_retransmit_handle: None,
            gather_consensus_handle: None,
            join_resend_handle: None,
            commit_handle: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn ring_id(&self) -> RingId {
        self.membership.ring_id
    }

    pub fn state(&self) -> MembState {
        self.membership.state
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }

    /// Record the network address of a candidate member. The membership
    /// protocol reasons about node-ids only; resolving ids to reachable
    /// addresses is the caller's job (in a full deployment, the interface
    /// translation layer of the redundant-ring collaborator above this
    /// core).
    pub fn set_node_address(&mut self, id: NodeId, addr: SocketAddr) {
        self.node_addresses.insert(id, addr);
        self.address_to_node.insert(addr, id);
    }

    /// List the local interfaces this instance would bind multicast on,
    /// for diagnostics.
    pub fn ifaces(&self) -> Vec<Ipv4Addr> {
        match self.config.bind_iface {
            Some(addr) => vec![addr],
            None => discover_interfaces(),
        }
    }

    /// Force this node back into Gather, abandoning its current
    /// membership view. Used to recover a node that was excluded from a
    /// ring reformation it should have been part of (a stuck or
    /// previously-partitioned node rejoining).
    pub fn ring_reenable(&mut self) -> Result<()> {
        log::info!("[instance {}] ring re-enable requested, re-entering Gather", self.node_id);
        self.enter_gather()
    }

    /// Register a callback fired on every token-received or token-sent
    /// event.
    pub fn register_token_callback(
        &mut self,
        kind: TokenCallbackKind,
        auto_delete: bool,
        callback: impl FnMut() + 'static,
    ) -> CallbackHandle {
        self.callbacks.register(kind, auto_delete, callback)
    }

    pub fn unregister_token_callback(&mut self, handle: CallbackHandle) {
        self.callbacks.unregister(handle);
    }

    /// Backpressure query: whether a send of `payload_len` bytes would be
    /// accepted by [`RingInstance::mcast`] right now.
    pub fn can_send(&self, payload_len: usize) -> bool {
        payload_len <= MAX_PAYLOAD_LEN && self.send_queue.available() > 0
    }

    /// Queue a message for totally-ordered multicast delivery. Actual
    /// transmission happens the next time this node holds the token.
    pub fn mcast(&mut self, payload: Vec<u8>, guarantee: Guarantee) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::SendQueueFull);
        }
        self.send_queue.push(OutgoingMessage {
            guarantee: guarantee as u32,
            payload,
        })?;
        // A quiescent representative holds the token until new traffic
        // arrives; a fresh send must wake it immediately.
        if let Some(token) = self.held_token.take() {
            self.forward_token(token)?;
        }
        Ok(())
    }

    /// Enter Gather and start forming a ring. Call once after construction
    /// (or after every member believes the prior ring has failed).
    pub fn start(&mut self) -> Result<()> {
        self.enter_gather()
    }

    fn enter_gather(&mut self) -> Result<()> {
        self.cancel_operational_timers();
        self.cancel_commit_timer();
        self.membership.enter_gather();
        self.send_join()?;
        self.arm_join_resend();
        self.arm_gather_consensus();
        Ok(())
    }

    fn is_representative(&self) -> bool {
        self.membership.ring_id.rep == self.node_id
    }

    fn successor(&self) -> Option<NodeId> {
        let candidates = self.membership.candidate_list().into_sorted_vec();
        let pos = candidates.iter().position(|&id| id == self.node_id)?;
        if candidates.len() == 1 {
            // Alone on the ring: the token still has to circulate for
            // stamping and delivery to proceed, so this node is its own
            // successor.
            return Some(self.node_id);
        }
        Some(candidates[(pos + 1) % candidates.len()])
    }

    fn address_of(&self, id: NodeId) -> Result<SocketAddr> {
        self.node_addresses.get(&id).copied().ok_or(Error::NoSuccessor)
    }

    // ====================================================================
    // Timer bookkeeping
    // ====================================================================

    fn rearm_token_timeout(&mut self) {
        let dur = Duration::from_millis(self.config.token_timeout_ms as u64);
        self.token_timeout_handle = Some(self.timers.rearm(self.token_timeout_handle, dur));
    }

    fn rearm_token_retransmit(&mut self) {
        let dur = Duration::from_millis(self.config.token_retransmit_ms as u64);
        self.token_retransmit_handle = Some(self.timers.rearm(self.token_retransmit_handle, dur));
    }

    fn cancel_operational_timers(&mut self) {
        if let Some(h) = self.token_timeout_handle.take() {
            self.timers.cancel(h);
        }
        if let Some(h) = self.token_retransmit_handle.take() {
            self.timers.cancel(h);
        }
    }

    fn arm_join_resend(&mut self) {
        let dur = Duration::from_millis(self.config.gather_join_ms as u64);
        self.join_resend_handle = Some(self.timers.rearm(self.join_resend_handle, dur));
    }

    fn arm_gather_consensus(&mut self) {
        let dur = Duration::from_millis(self.config.gather_consensus_ms as u64);
        self.gather_consensus_handle = Some(self.timers.rearm(self.gather_consensus_handle, dur));
    }

    fn cancel_gather_timers(&mut self) {
        if let Some(h) = self.join_resend_handle.take() {
            self.timers.cancel(h);
        }
        if let Some(h) = self.gather_consensus_handle.take() {
            self.timers.cancel(h);
        }
    }

    fn arm_commit_timer(&mut self) {
        let dur = Duration::from_millis(self.config.commit_ms as u64);
        self.commit_handle = Some(self.timers.rearm(self.commit_handle, dur));
    }

    fn cancel_commit_timer(&mut self) {
        if let Some(h) = self.commit_handle.take() {
            self.timers.cancel(h);
        }
    }

    // ====================================================================
    // Gather / Commit messaging
    // ====================================================================

    fn send_join(&mut self) -> Result<()> {
        let join = self.membership.build_join();
        let datagram = self.frame_codec.encode(&join.encode());
        self.transport.send_mcast(&datagram)
    }

    fn propose_commit(&mut self) -> Result<()> {
        let candidates = self.membership.candidate_list();
        let n = candidates.len();
        let placeholder = CommitMemb {
            ring_id: RingId::ZERO,
            aru: 0,
            high_delivered: 0,
            received_flag: false,
        };
        let per_member = vec![placeholder; n];
        // Ring sequence advances by 4 per reformation, not 1 (mirrors the
        // source's TOKEN_RING_ID_SEQ gap so token/commit-token ring ids
        // never collide with a stale retransmission of the prior ring).
        let next_ring_seq = self.membership.ring_id.seq + 4;
        let mut token = self.membership.build_commit_token(0, next_ring_seq, per_member);
        // Mirrors the source's convention of starting memb_index one
        // behind the creator's own slot, so the first advance lands on
        // index 0 and the token still visits every member exactly once.
        token.memb_index = (n as u32).saturating_sub(1);
        self.membership.state = MembState::Commit;
        self.cancel_gather_timers();
        self.arm_commit_timer();
        self.fill_and_continue_commit(token)
    }

    fn fill_and_continue_commit(&mut self, mut token: MembCommitToken) -> Result<()> {
        let my_ring_id = RingId::new(self.node_id, self.membership.ring_id.seq);
        let received_flag = self.my_aru == self.my_high_seq_received;
        self.membership
            .advance_commit_token(&mut token, my_ring_id, self.my_aru, self.my_high_seq_received, received_flag);

        if token.memb_list.iter().all(|m| m.ring_id != RingId::ZERO) {
            self.complete_commit(token)
        } else {
            self.forward_commit_token(&token)
        }
    }

    fn forward_commit_token(&mut self, token: &MembCommitToken) -> Result<()> {
        let next_idx = (token.memb_index as usize + 1) % token.addr_list.len().max(1);
        let next_node = token.addr_list[next_idx];
        let addr = self.address_of(next_node)?;
        let datagram = self.frame_codec.encode(&token.encode());
        self.transport.send_token(&datagram, addr)
    }

    fn complete_commit(&mut self, token: MembCommitToken) -> Result<()> {
        self.cancel_commit_timer();
        self.membership.my_aru_save = self.my_aru;
        self.membership.my_high_seq_received_save = self.my_high_seq_received;
        let init = self.membership.on_commit_token_received(&token);

        persist::write_ring_seq(&self.config.persist_path, self.membership.ring_id.seq)?;

        if init.needs_retransmit_from_trans {
            self.enqueue_recovery_retransmits()?;
        }

        self.barrier_seq = init.barrier_seq;
        self.my_aru = 0;
        self.my_high_seq_received = 0;
        self.recovery_buffer.reinit(0);
        self.retrans_zero_rounds = 0;
        self.token_engine.reset_aru_tracking();

        if self.is_representative() {
            self.send_token_initial()?;
        }
        Ok(())
    }

    /// Copy every message this node holds in `(my_aru_save, high_seq_received_save]`
    /// into the recovery queue, so it gets re-stamped and re-sent under the
    /// new ring for the benefit of transitional members who reported an
    /// incomplete receive set.
    fn enqueue_recovery_retransmits(&mut self) -> Result<()> {
        let from = self.membership.my_aru_save.wrapping_add(1);
        let to = self.membership.my_high_seq_received_save;
        let mut seq = from;
        while seq <= to {
            if let Some(raw) = self.buffer.get(seq) {
                if let Ok((msg, _)) = crate::wire::McastMessage::decode(raw) {
                    // Recovery queue capacity mirrors the send queue; a
                    // full queue here means something is very wrong with
                    // sizing, not a condition to silently drop under.
                    self.recovery_queue.push(OutgoingMessage {
                        guarantee: msg.guarantee,
                        payload: msg.payload,
                    })?;
                }
            }
            seq = seq.wrapping_add(1);
        }
        Ok(())
    }

    fn maybe_complete_recovery(&mut self, token: &OrfToken, events: &mut Vec<RingEvent>) {
        if self.membership.state != MembState::Recovery {
            return;
        }
        if token.retrans_flag {
            self.retrans_zero_rounds = 0;
        } else {
            self.retrans_zero_rounds += 1;
        }
        let ready = self.retrans_zero_rounds >= 2
            && self.recovery_queue.is_empty()
            && self.my_aru == self.barrier_seq
            && token.aru == self.barrier_seq;
        if !ready {
            return;
        }

        for delivered in self.delivery.drain(&self.buffer) {
            self.stats.messages_delivered += 1;
            events.push(RingEvent::Delivered(delivered));
        }

        let (transitional, regular) = self.membership.complete_recovery();
        events.push(RingEvent::MembershipChanged(transitional));

        std::mem::swap(&mut self.buffer, &mut self.recovery_buffer);
        self.recovery_buffer.reinit(0);
        self.delivery = DeliveryEngine::new(0);
        self.recovery_queue.drain_into(&mut self.send_queue);

        events.push(RingEvent::MembershipChanged(regular));

        self.retrans_zero_rounds = 0;
        self.token_engine.reset_aru_tracking();
    }

    // ====================================================================
    // Token lifecycle
    // ====================================================================

    fn send_token_initial(&mut self) -> Result<()> {
        let token = OrfToken {
            seq: self.my_high_seq_received,
            token_seq: 0,
            aru: self.my_aru,
            aru_addr: self.node_id,
            ring_id: self.membership.ring_id,
            fcc: 0,
            retrans_flag: self.membership.state == MembState::Recovery,
            rtr_list: Vec::new(),
        };
        self.forward_token(token)
    }

    fn forward_token(&mut self, token: OrfToken) -> Result<()> {
        let datagram = self.frame_codec.encode(&token.encode());
        let successor = self.successor().ok_or(Error::NoSuccessor)?;
        let addr = self.address_of(successor)?;
        self.transport.send_token(&datagram, addr)?;
        self.last_token_datagram = Some(datagram);
        self.last_token_dest = Some(addr);
        self.stats.tokens_sent += 1;
        self.callbacks.fire(TokenCallbackKind::Sent);
        self.rearm_token_retransmit();
        self.rearm_token_timeout();
        Ok(())
    }

    fn retransmit_last_token(&mut self) -> Result<()> {
        if let (Some(datagram), Some(addr)) = (self.last_token_datagram.clone(), self.last_token_dest) {
            self.transport.send_token(&datagram, addr)?;
        }
        Ok(())
    }

    fn flush_pending_mcast(&mut self, events: &mut Vec<RingEvent>) -> Result<()> {
        let mut pending = Vec::new();
        self.transport.drain_mcast(|datagram, from| pending.push((datagram.to_vec(), from)))?;
        for (datagram, from) in pending {
            self.dispatch_datagram(&datagram, from, events)?;
        }
        Ok(())
    }

    fn handle_token(&mut self, raw: &[u8], events: &mut Vec<RingEvent>) -> Result<()> {
        let (mut token, swap) = OrfToken::decode(raw)?;
        if swap {
            log::warn!(
                "[instance {}] foreign-endian token from peer; mixed-architecture rings are not supported",
                self.node_id
            );
        }

        // (b) drain whatever mcast traffic is already queued before acting
        // on the token, so a lossy interface cannot wedge delivery behind
        // token rotation.
        self.flush_pending_mcast(events)?;

        // (c)
        if self.membership.state == MembState::Commit {
            log::trace!("[instance {}] token discarded while in Commit", self.node_id);
            return Ok(());
        }
        // (d)
        if token.ring_id != self.membership.ring_id {
            log::trace!(
                "[instance {}] token for foreign ring {} discarded (local ring {})",
                self.node_id,
                token.ring_id,
                self.membership.ring_id
            );
            return Ok(());
        }
        // (e)
        if !self.token_engine.check_token_seq(token.token_seq) {
            self.rearm_token_retransmit();
            self.rearm_token_timeout();
            return Ok(());
        }

        self.stats.tokens_received += 1;
        self.token_engine.observe_token_seq(token.token_seq);
        self.token_engine.update_seq_unchanged(token.seq);
        self.callbacks.fire(TokenCallbackKind::Received);

        if self
            .token_engine
            .observe_aru(token.aru, token.aru_addr, self.config.fail_to_recv_const)
            && token.aru_addr == self.node_id
        {
            log::warn!(
                "[instance {}] no receive progress for {} rounds, declaring {} failed",
                self.node_id,
                self.config.fail_to_recv_const,
                token.aru_addr
            );
            self.membership.failed_list.insert(token.aru_addr);
            return self.enter_gather();
        }

        self.my_last_aru = self.my_aru;

        let recovering = self.membership.state == MembState::Recovery;
        let budget = self
            .flow_control
            .transmits_allowed(token.fcc as u32, token.aru, self.my_last_aru, token.token_seq);

        let buffer = if recovering { &mut self.recovery_buffer } else { &mut self.buffer };
        let serviced = RetransmitEngine::service_requests(&mut token.rtr_list, token.ring_id, buffer, budget.transmits_allowed);
        for datagram in &serviced {
            let encrypted = self.frame_codec.encode(datagram);
            self.transport.send_mcast(&encrypted)?;
        }
        self.stats.remcasts_sent += serviced.len() as u64;
        let gaps_before = token.rtr_list.len();
        RetransmitEngine::add_local_gaps(
            &mut token.rtr_list,
            token.ring_id,
            self.my_aru,
            self.my_high_seq_received,
            buffer,
            self.config.retransmit_entries_max,
        );
        self.stats.retransmit_requests_made += token.rtr_list.len().saturating_sub(gaps_before) as u64;

        let remaining_budget = budget.transmits_allowed.saturating_sub(serviced.len() as u32);
        let mcast_budget = if budget.new_mcasts_braked && !recovering { 0 } else { remaining_budget };
        let queue = if recovering { &mut self.recovery_queue } else { &mut self.send_queue };
        let buffer = if recovering { &mut self.recovery_buffer } else { &mut self.buffer };
        let (sent, new_high) = Multicaster::drain(
            queue,
            buffer,
            &mut token.seq,
            token.ring_id,
            self.node_id,
            mcast_budget,
            self.my_high_seq_received,
        );
        for datagram in &sent {
            let encrypted = self.frame_codec.encode(datagram);
            self.transport.send_mcast(&encrypted)?;
        }
        self.stats.mcasts_sent += sent.len() as u64;
        self.my_high_seq_received = new_high;

        let buffer = if recovering { &self.recovery_buffer } else { &self.buffer };
        self.my_aru = advance_aru(buffer, self.my_aru, self.my_high_seq_received);

        if self.my_aru < token.aru {
            token.aru = self.my_aru;
            token.aru_addr = self.node_id;
        }

        token.fcc = FlowControl::update_fcc(
            token.fcc as u32,
            sent.len() as u32,
            serviced.len() as u32,
            self.last_round_sent,
        ) as u16;
        self.last_round_sent = sent.len() as u32 + serviced.len() as u32;

        if !recovering {
            for delivered in self.delivery.drain(&self.buffer) {
                self.stats.messages_delivered += 1;
                events.push(RingEvent::Delivered(delivered));
            }
            // Every message below the group's all-received-up-to point has
            // reached every live member and was just handed to delivery
            // above; no one can still need it for retransmission.
            self.buffer.release_up_to(token.aru);
        }

        self.maybe_complete_recovery(&token, events);

        token.token_seq = token.token_seq.wrapping_add(1);

        if self.token_engine.should_hold_token(self.is_representative(), self.config.seqno_unchanged_const) {
            self.held_token = Some(token);
            self.rearm_token_timeout();
        } else {
            self.forward_token(token)?;
        }
        Ok(())
    }

    // ====================================================================
    // Plaintext dispatch
    // ====================================================================

    fn resolve_sender(&self, from: SocketAddr) -> Option<NodeId> {
        self.address_to_node.get(&from).copied()
    }

    fn dispatch_datagram(&mut self, encrypted: &[u8], from: SocketAddr, events: &mut Vec<RingEvent>) -> Result<()> {
        let plaintext = match self.frame_codec.decode(encrypted) {
            Ok(p) => p,
            Err(Error::FrameAuthFail) | Err(Error::FrameTooShort) => {
                self.stats.auth_failures += 1;
                log::debug!("[instance {}] dropped unauthenticated datagram from {}", self.node_id, from);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match peek_message_type(&plaintext)? {
            MessageType::OrfToken => self.handle_token(&plaintext, events),
            MessageType::Mcast => self.handle_mcast(&plaintext),
            MessageType::MembJoin => self.handle_join(&plaintext, from),
            MessageType::MembCommitToken => self.handle_commit_token(&plaintext),
        }
    }

    fn handle_mcast(&mut self, plaintext: &[u8]) -> Result<()> {
        let (msg, _swap) = crate::wire::McastMessage::decode(plaintext)?;
        if msg.ring_id != self.membership.ring_id {
            log::trace!("[instance {}] mcast for foreign ring dropped", self.node_id);
            return Ok(());
        }
        let buffer = if self.membership.state == MembState::Recovery {
            &mut self.recovery_buffer
        } else {
            &mut self.buffer
        };
        match buffer.insert(msg.seq, plaintext.to_vec()) {
            Ok(()) | Err(Error::AlreadyPresent(_)) => {}
            Err(e) => return Err(e),
        }
        if msg.seq.wrapping_sub(self.my_high_seq_received) < u32::MAX / 2 {
            self.my_high_seq_received = self.my_high_seq_received.max(msg.seq);
        }
        Ok(())
    }

    fn handle_join(&mut self, plaintext: &[u8], from: SocketAddr) -> Result<()> {
        let (join, _swap) = MembJoin::decode(plaintext)?;
        let Some(sender) = self.resolve_sender(from) else {
            log::debug!("[instance {}] join from unregistered address {}", self.node_id, from);
            return Ok(());
        };
        let outcome = self.membership.on_join_received(sender, &join);
        use crate::membership::JoinOutcome;
        match outcome {
            JoinOutcome::Reformed => {
                self.cancel_gather_timers();
                self.send_join()?;
                self.arm_join_resend();
                self.arm_gather_consensus();
            }
            JoinOutcome::ConsensusSet => {
                if self.membership.consensus_agreed() && self.membership.is_lowest_member() {
                    self.propose_commit()?;
                }
            }
            JoinOutcome::Ignored => {}
        }
        Ok(())
    }

    fn handle_commit_token(&mut self, plaintext: &[u8]) -> Result<()> {
        let (token, _swap) = MembCommitToken::decode(plaintext)?;
        if !token.addr_list.contains(&self.node_id) {
            return Ok(());
        }
        match self.membership.state {
            MembState::Gather => {
                if token.ring_id.seq <= self.membership.ring_id.seq {
                    log::trace!("[instance {}] stale commit token ignored", self.node_id);
                    return Ok(());
                }
                self.cancel_gather_timers();
                self.membership.state = MembState::Commit;
                self.arm_commit_timer();
            }
            MembState::Commit => {}
            MembState::Operational | MembState::Recovery => return Ok(()),
        }
        self.fill_and_continue_commit(token)
    }

    // ====================================================================
    // Event loop
    // ====================================================================

    /// Block for at most `timeout` (capped by the nearest armed timer),
    /// service whichever sockets became readable, expire due timers, and
    /// return the events produced.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<Vec<RingEvent>> {
        let mut events = Vec::new();
        let poll_timeout = match (timeout, self.timers.next_timeout()) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (Some(t), None) => Some(t),
            (None, n) => n,
        };

        let mut mio_events = mio::Events::with_capacity(64);
        self.poll.poll(&mut mio_events, poll_timeout)?;

        let mut mcast_ready = false;
        let mut token_ready = false;
        for event in mio_events.iter() {
            match event.token() {
                MCAST_TOKEN => mcast_ready = true,
                UNICAST_TOKEN => token_ready = true,
                _ => {}
            }
        }

        if mcast_ready {
            self.flush_pending_mcast(&mut events)?;
        }
        if token_ready {
            let mut buf = [0u8; 65536];
            loop {
                match self.transport.try_recv_token(&mut buf)? {
                    Some((n, from)) => self.dispatch_datagram(&buf[..n], from, &mut events)?,
                    None => break,
                }
            }
        }

        for handle in self.timers.expire() {
            self.handle_timer(handle, &mut events)?;
        }

        Ok(events)
    }

    fn handle_timer(&mut self, handle: TimerHandle, _events: &mut [RingEvent]) -> Result<()> {
        if Some(handle) == self.token_timeout_handle {
            log::warn!("[instance {}] token timeout, re-entering Gather", self.node_id);
            self.token_timeout_handle = None;
            self.enter_gather()?;
        } else if Some(handle) == self.token_retransmit_handle {
            self.retransmit_last_token()?;
            self.rearm_token_retransmit();
        } else if Some(handle) == self.join_resend_handle {
            self.send_join()?;
            self.arm_join_resend();
        } else if Some(handle) == self.gather_consensus_handle {
            if self.membership.state == MembState::Gather {
                if self.membership.consensus_agreed() && self.membership.is_lowest_member() {
                    self.propose_commit()?;
                } else {
                    self.arm_gather_consensus();
                }
            }
        } else if Some(handle) == self.commit_handle {
            if self.membership.state == MembState::Commit {
                log::warn!("[instance {}] commit timed out, falling back to Gather", self.node_id);
                self.commit_handle = None;
                self.enter_gather()?;
            }
        }
        Ok(())
    }
}

/// Advance `my_aru` as far as the buffer's contiguous occupancy allows,
/// capped at `my_high_seq_received` (can't claim receipt of seqs that
/// were never stamped onto the ring yet).
fn advance_aru(buffer: &SortedBuffer, from: u32, high_seq_received: u32) -> u32 {
    let mut aru = from;
    while aru < high_seq_received {
        let next = aru.wrapping_add(1);
        if buffer.in_use(next) {
            aru = next;
        } else {
            break;
        }
    }
    aru
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_aru_stops_at_first_gap() {
        let mut buf = SortedBuffer::new(8);
        buf.insert(1, vec![1]).unwrap();
        buf.insert(2, vec![2]).unwrap();
        buf.insert(4, vec![4]).unwrap();
        assert_eq!(advance_aru(&buf, 0, 5), 2);
    }

    #[test]
    fn advance_aru_never_exceeds_high_seq_received() {
        let mut buf = SortedBuffer::new(8);
        for s in 1..=5 {
            buf.insert(s, vec![s as u8]).unwrap();
        }
        assert_eq!(advance_aru(&buf, 0, 3), 3);
    }

    fn test_config(node_id: NodeId, dir: &std::path::Path) -> RingConfig {
        let mut cfg = RingConfig::new(
            node_id,
            std::net::Ipv4Addr::new(239, 2, 11, 1),
            b"shared-secret-material".to_vec(),
            dir.join(format!("node-{node_id}.seq")),
        );
        cfg.mcast_port = 0; // bind to an ephemeral port; tests never join a real ring
        cfg
    }

    #[test]
    fn new_instance_starts_alone_in_its_own_ring() {
        let dir = tempfile::tempdir().unwrap();
        let instance = RingInstance::new(test_config(7, dir.path())).unwrap();
        assert_eq!(instance.node_id(), 7);
        assert_eq!(instance.state(), MembState::Operational);
    }

    #[test]
    fn can_send_respects_payload_and_queue_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = RingInstance::new(test_config(1, dir.path())).unwrap();
        assert!(instance.can_send(10));
        assert!(!instance.can_send(MAX_PAYLOAD_LEN + 1));
        for _ in 0..instance.config.send_queue_capacity {
            instance.mcast(vec![0], Guarantee::Agreed).unwrap();
        }
        assert!(!instance.can_send(1));
    }

    #[test]
    fn ifaces_honors_explicit_bind() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = RingInstance::new(test_config(1, dir.path())).unwrap();
        // Binding to a specific interface address happens at construction
        // time; poking the field afterward is enough to exercise the
        // diagnostic without rebinding to an address this host doesn't own.
        instance.config.bind_iface = Some(Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(instance.ifaces(), vec![Ipv4Addr::new(10, 0, 0, 9)]);
    }

    #[test]
    fn lone_node_is_its_own_successor() {
        let dir = tempfile::tempdir().unwrap();
        let instance = RingInstance::new(test_config(1, dir.path())).unwrap();
        assert_eq!(instance.successor(), Some(1));
    }

    #[test]
    fn lone_node_forwards_token_to_its_own_loopback_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = RingInstance::new(test_config(3, dir.path())).unwrap();
        // Before the fix this returned `Err(NoSuccessor)`: a one-member
        // candidate set had no successor at all.
        instance.send_token_initial().unwrap();
        assert!(instance.stats().tokens_sent >= 1);
        // The token just sent to ourselves must be readable back off the
        // same unicast socket (loopback) rather than vanishing.
        instance.poll_once(Some(Duration::from_millis(200))).unwrap();
        assert!(instance.stats().tokens_received >= 1);
    }
}
