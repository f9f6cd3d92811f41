// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # totem-srp - Single-Ring Totem Protocol core
//!
//! A reliable, totally-ordered, virtually-synchronous group communication
//! protocol. Delivers multicast messages in agreed order to every live
//! member of a process group and notifies the group of membership changes
//! with Extended Virtual Synchrony (EVS) guarantees.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::Ipv4Addr;
//! use totem_srp::{Guarantee, RingConfig, RingInstance};
//!
//! fn main() -> totem_srp::Result<()> {
//!     let config = RingConfig::new(1, Ipv4Addr::new(239, 2, 11, 1), b"shared-secret".to_vec(), "/tmp/node-1.seq");
//!     let mut ring = RingInstance::new(config)?;
//!     ring.start()?;
//!     ring.mcast(b"hello ring".to_vec(), Guarantee::Agreed)?;
//!     for event in ring.poll_once(None)? {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          RingInstance (event loop)                  |
//! |  DatagramTransport -> FrameCodec -> dispatch by message type        |
//! |       OrfToken | Mcast | MembJoin | MembCommitToken                 |
//! |  TokenEngine -> MembershipProtocol -> RetransmitEngine ->           |
//! |  Multicaster -> DeliveryEngine -> FlowControl                        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! This core is single-threaded and cooperative: every collaborator above
//! is owned exclusively by [`RingInstance`], and nothing is shared across
//! threads. Out of scope (treated as collaborators by a higher layer):
//! checkpoint/event/lock services, message packing/fragmentation, a
//! redundant-ring (RRP) layer composing multiple single rings.
//!
//! ## Modules Overview
//!
//! - [`instance`] - the event loop and public `RingInstance` API (start here)
//! - [`membership`] - Gather/Commit/Recovery/Operational state machine
//! - [`token_engine`] - token rotation, dedup, failure detection, quiesce
//! - [`codec`] - authenticated, enciphered datagram transform
//! - [`wire`] - wire encode/decode of the four datagram payload types
//! - [`config`] - every tunable knob and its default

// Clippy: no blanket suppressions beyond what's declared in Cargo.toml's [lints.clippy].

pub mod buffer;
pub mod callbacks;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod error;
pub mod flow_control;
pub mod instance;
pub mod membership;
pub mod membership_set;
pub mod multicaster;
pub mod node;
pub mod persist;
pub mod queue;
pub mod retransmit;
pub mod stats;
pub mod timers;
pub mod token_engine;
pub mod transport;
pub mod wire;

pub use config::RingConfig;
pub use error::{Error, Result};
pub use instance::{Guarantee, RingEvent, RingInstance, MAX_PAYLOAD_LEN};
pub use membership::{ConfChg, ConfigType, MembState};
pub use node::{NodeId, RingId};
pub use stats::RingStats;
