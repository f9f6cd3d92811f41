// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gather / Commit / Recovery / Operational membership state machine.
//!
//! This is the largest single component of the ring core: it owns the
//! candidate and agreed membership lists, drives consensus over joins,
//! and computes the transitional membership and barrier sequence that
//! give the ring its Extended Virtual Synchrony guarantees.

use crate::membership_set::MembershipSet;
use crate::node::{NodeId, RingId};
use crate::wire::{CommitMemb, MembCommitToken, MembJoin};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembState {
    Operational,
    Gather,
    Commit,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Transitional,
    Regular,
}

/// A membership-change notification handed to the application collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfChg {
    pub config_type: ConfigType,
    pub member_list: Vec<NodeId>,
    pub left_list: Vec<NodeId>,
    pub joined_list: Vec<NodeId>,
    pub ring_id: RingId,
}

/// What happened to a received join message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Sender's lists matched ours; its consensus bit is now set.
    ConsensusSet,
    /// Sender was a failed node, or a (non-strict) subset of our view; no action.
    Ignored,
    /// Lists diverged; merged and re-entered Gather.
    Reformed,
}

/// Computed once a matching CommitToken is received, to drive the
/// Commit -> Recovery transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryInit {
    pub barrier_seq: u32,
    pub trans_memb_list: Vec<NodeId>,
    pub new_memb_list: Vec<NodeId>,
    pub needs_retransmit_from_trans: bool,
}

/// Gather / Commit / Recovery / Operational state machine for a single ring.
pub struct MembershipProtocol {
    pub state: MembState,
    pub node_id: NodeId,
    pub ring_id: RingId,
    pub proc_list: MembershipSet,
    pub failed_list: MembershipSet,
    pub new_memb_list: MembershipSet,
    pub trans_memb_list: MembershipSet,
    pub memb_list: MembershipSet,
    consensus_list: HashMap<NodeId, bool>,
    pub my_aru_save: u32,
    pub my_high_seq_received_save: u32,
}

impl MembershipProtocol {
    pub fn new(node_id: NodeId, ring_id: RingId) -> Self {
        let solo = MembershipSet::from_iter([node_id]);
        Self {
            state: MembState::Operational,
            node_id,
            ring_id,
            proc_list: solo.clone(),
            failed_list: MembershipSet::new(),
            new_memb_list: MembershipSet::new(),
            trans_memb_list: MembershipSet::new(),
            memb_list: solo,
            consensus_list: HashMap::new(),
            my_aru_save: 0,
            my_high_seq_received_save: 0,
        }
    }

    /// Live membership under consideration: `proc_list \ failed_list`.
    pub fn candidate_list(&self) -> MembershipSet {
        self.proc_list.difference(&self.failed_list)
    }

    /// Transition to Gather, resetting consensus tracking to "only I have
    /// acknowledged my own view".
    pub fn enter_gather(&mut self) {
        self.state = MembState::Gather;
        self.consensus_list.clear();
        self.consensus_list.insert(self.node_id, true);
    }

    /// Whether every live candidate has acknowledged a matching view.
    pub fn consensus_agreed(&self) -> bool {
        let live = self.candidate_list();
        !live.is_empty() && live.iter().all(|id| self.consensus_list.get(id) == Some(&true))
    }

    /// Whether this node is the lowest id among live candidates, and thus
    /// responsible for originating the CommitToken.
    pub fn is_lowest_member(&self) -> bool {
        self.candidate_list().lowest() == Some(self.node_id)
    }

    fn join_message(&self) -> MembJoin {
        MembJoin {
            ring_seq: self.ring_id.seq,
            proc_list: self.proc_list.clone().into_sorted_vec(),
            failed_list: self.failed_list.clone().into_sorted_vec(),
        }
    }

    /// Build the outbound join message re-broadcast while in Gather.
    pub fn build_join(&self) -> MembJoin {
        self.join_message()
    }

    /// Process a join message from `sender`. See module docs for the
    /// four processing rules this implements.
    pub fn on_join_received(&mut self, sender: NodeId, join: &MembJoin) -> JoinOutcome {
        let sender_proc = MembershipSet::from_iter(join.proc_list.iter().copied());
        let sender_failed = MembershipSet::from_iter(join.failed_list.iter().copied());

        if sender_proc == self.proc_list && sender_failed == self.failed_list {
            self.consensus_list.insert(sender, true);
            return JoinOutcome::ConsensusSet;
        }
        if self.failed_list.contains(sender) {
            return JoinOutcome::Ignored;
        }
        if sender_proc.is_subset(&self.proc_list) && sender_failed.is_subset(&self.failed_list) {
            return JoinOutcome::Ignored;
        }

        if sender_failed.contains(self.node_id) {
            self.failed_list.insert(sender);
        } else {
            self.failed_list.merge(&sender_failed);
        }
        self.proc_list.merge(&sender_proc);
        self.enter_gather();
        JoinOutcome::Reformed
    }

    /// Construct the CommitToken this node proposes as ring representative.
    /// `per_member` supplies each candidate's recovery bookkeeping in the
    /// same order as `candidate_list()`'s sorted iteration.
    pub fn build_commit_token(&self, token_seq: u32, next_ring_seq: u64, per_member: Vec<CommitMemb>) -> MembCommitToken {
        let addr_list = self.candidate_list().into_sorted_vec();
        MembCommitToken {
            token_seq,
            ring_id: RingId::new(self.node_id, next_ring_seq),
            retrans_flag: false,
            memb_index: 0,
            addr_list,
            memb_list: per_member,
        }
    }

    /// Stamp this node's own recovery bookkeeping into the next open slot
    /// of a CommitToken as it hops around the candidate ring, mirroring
    /// the `memb_index`-driven round-robin fill used while proposing a
    /// new membership. Advances `memb_index` and bumps `token_seq`.
    pub fn advance_commit_token(
        &self,
        token: &mut MembCommitToken,
        my_ring_id: RingId,
        my_aru: u32,
        my_high_seq_received: u32,
        my_received_flag: bool,
    ) {
        let n = token.addr_list.len();
        if n == 0 {
            return;
        }
        let idx = (token.memb_index as usize + 1) % n;
        if let Some(slot) = token.memb_list.get_mut(idx) {
            *slot = CommitMemb {
                ring_id: my_ring_id,
                aru: my_aru,
                high_delivered: my_high_seq_received,
                received_flag: my_received_flag,
            };
        }
        token.memb_index = idx as u32;
        token.token_seq = token.token_seq.wrapping_add(1);
    }

    /// Handle reception of a CommitToken whose `ring_id` matches what we
    /// proposed or are expecting. Installs the new membership, computes
    /// the transitional set and barrier, and moves to Recovery.
    pub fn on_commit_token_received(&mut self, token: &MembCommitToken) -> RecoveryInit {
        let old_memb = self.memb_list.clone();
        let new_memb = MembershipSet::from_iter(token.addr_list.iter().copied());
        let trans_memb = old_memb.intersection(&new_memb);

        let barrier_seq = token
            .memb_list
            .iter()
            .map(|m| m.high_delivered)
            .max()
            .unwrap_or(0)
            .wrapping_add(1);

        let needs_retransmit_from_trans = token.memb_list.iter().enumerate().any(|(i, m)| {
            !m.received_flag && token.addr_list.get(i).is_some_and(|id| trans_memb.contains(*id))
        });

        self.ring_id = token.ring_id;
        self.new_memb_list = new_memb.clone();
        self.trans_memb_list = trans_memb.clone();
        self.state = MembState::Recovery;
        self.failed_list = MembershipSet::new();

        RecoveryInit {
            barrier_seq,
            trans_memb_list: trans_memb.into_sorted_vec(),
            new_memb_list: new_memb.into_sorted_vec(),
            needs_retransmit_from_trans,
        }
    }

    /// Complete Recovery -> Operational once the barrier condition holds.
    /// Returns the transitional and regular confchg events to deliver, in
    /// order.
    pub fn complete_recovery(&mut self) -> (ConfChg, ConfChg) {
        let old_memb = self.memb_list.clone();
        let left: Vec<NodeId> = old_memb.difference(&self.trans_memb_list).into_sorted_vec();
        let joined: Vec<NodeId> = self.new_memb_list.difference(&self.trans_memb_list).into_sorted_vec();

        let transitional = ConfChg {
            config_type: ConfigType::Transitional,
            member_list: self.trans_memb_list.clone().into_sorted_vec(),
            left_list: left,
            joined_list: Vec::new(),
            ring_id: self.ring_id,
        };
        let regular = ConfChg {
            config_type: ConfigType::Regular,
            member_list: self.new_memb_list.clone().into_sorted_vec(),
            left_list: Vec::new(),
            joined_list: joined,
            ring_id: self.ring_id,
        };

        self.memb_list = self.new_memb_list.clone();
        self.proc_list = self.new_memb_list.clone();
        self.state = MembState::Operational;
        (transitional, regular)
    }

    /// Token loss while not Operational. Gather/Commit re-enter Gather;
    /// Recovery restores the pre-recovery aru/high-seq bookmarks before
    /// re-entering Gather (actual buffer reinit is the caller's job).
    pub fn on_token_loss(&mut self) {
        self.enter_gather();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memb(node_id: NodeId) -> MembershipProtocol {
        MembershipProtocol::new(node_id, RingId::new(node_id, 0))
    }

    #[test]
    fn solo_node_is_lowest_member() {
        let m = memb(5);
        assert!(m.is_lowest_member());
    }

    #[test]
    fn matching_join_sets_consensus() {
        let mut a = memb(1);
        a.proc_list = MembershipSet::from_iter([1, 2]);
        a.enter_gather();
        let join_from_2 = MembJoin {
            ring_seq: 0,
            proc_list: vec![1, 2],
            failed_list: vec![],
        };
        assert_eq!(a.on_join_received(2, &join_from_2), JoinOutcome::ConsensusSet);
        assert!(a.consensus_agreed());
    }

    #[test]
    fn diverging_join_merges_and_reenters_gather() {
        let mut a = memb(1);
        let join_from_3 = MembJoin {
            ring_seq: 0,
            proc_list: vec![1, 3],
            failed_list: vec![],
        };
        assert_eq!(a.on_join_received(3, &join_from_3), JoinOutcome::Reformed);
        assert!(a.proc_list.contains(3));
        assert_eq!(a.state, MembState::Gather);
    }

    #[test]
    fn join_from_failed_node_ignored() {
        let mut a = memb(1);
        a.failed_list.insert(9);
        let join = MembJoin {
            ring_seq: 0,
            proc_list: vec![1, 9],
            failed_list: vec![],
        };
        assert_eq!(a.on_join_received(9, &join), JoinOutcome::Ignored);
    }

    #[test]
    fn commit_token_computes_transitional_and_barrier() {
        let mut a = memb(1);
        a.memb_list = MembershipSet::from_iter([1, 2]);
        let token = MembCommitToken {
            token_seq: 1,
            ring_id: RingId::new(1, 4),
            retrans_flag: false,
            memb_index: 0,
            addr_list: vec![1, 2, 3],
            memb_list: vec![
                CommitMemb {
                    ring_id: RingId::new(1, 0),
                    aru: 10,
                    high_delivered: 10,
                    received_flag: true,
                },
                CommitMemb {
                    ring_id: RingId::new(1, 0),
                    aru: 8,
                    high_delivered: 8,
                    received_flag: false,
                },
                CommitMemb {
                    ring_id: RingId::new(3, 0),
                    aru: 0,
                    high_delivered: 0,
                    received_flag: true,
                },
            ],
        };
        let init = a.on_commit_token_received(&token);
        assert_eq!(init.barrier_seq, 11);
        assert_eq!(init.trans_memb_list, vec![1, 2]);
        assert_eq!(init.new_memb_list, vec![1, 2, 3]);
        assert!(init.needs_retransmit_from_trans);
        assert_eq!(a.state, MembState::Recovery);
    }

    #[test]
    fn advance_commit_token_fills_next_slot_and_bumps_counters() {
        let a = memb(2);
        let mut token = MembCommitToken {
            token_seq: 5,
            ring_id: RingId::new(1, 9),
            retrans_flag: false,
            memb_index: 0,
            addr_list: vec![1, 2, 3],
            memb_list: vec![
                CommitMemb {
                    ring_id: RingId::new(1, 9),
                    aru: 4,
                    high_delivered: 4,
                    received_flag: true,
                },
                CommitMemb {
                    ring_id: RingId::ZERO,
                    aru: 0,
                    high_delivered: 0,
                    received_flag: false,
                },
                CommitMemb {
                    ring_id: RingId::ZERO,
                    aru: 0,
                    high_delivered: 0,
                    received_flag: false,
                },
            ],
        };
        a.advance_commit_token(&mut token, RingId::new(2, 9), 7, 7, true);
        assert_eq!(token.memb_index, 1);
        assert_eq!(token.token_seq, 6);
        assert_eq!(token.memb_list[1].ring_id, RingId::new(2, 9));
        assert_eq!(token.memb_list[1].aru, 7);
    }

    #[test]
    fn complete_recovery_emits_transitional_then_regular() {
        let mut a = memb(1);
        a.memb_list = MembershipSet::from_iter([1, 2]);
        a.trans_memb_list = MembershipSet::from_iter([1, 2]);
        a.new_memb_list = MembershipSet::from_iter([1, 2, 3]);
        let (trans, regular) = a.complete_recovery();
        assert_eq!(trans.config_type, ConfigType::Transitional);
        assert!(trans.left_list.is_empty());
        assert_eq!(regular.config_type, ConfigType::Regular);
        assert_eq!(regular.joined_list, vec![3]);
        assert_eq!(a.state, MembState::Operational);
    }
}
