// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! totem-node - stand up a single Totem ring node from the command line.
//!
//! Reads newline-delimited payloads from stdin and multicasts each one;
//! logs every delivered message and membership change to stderr via
//! `env_logger`. Intended as a demo/smoke-test harness for the ring core,
//! not a production deployment tool (packing, RRP, and checkpoint
//! services above this core are out of scope; see crate docs).

use clap::Parser;
use std::io::BufRead;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use totem_srp::{Guarantee, RingConfig, RingEvent, RingInstance};

/// Stand up a single Totem single-ring-protocol node.
#[derive(Parser, Debug)]
#[command(name = "totem-node")]
#[command(version)]
#[command(about = "Run a Totem single-ring protocol node")]
struct Args {
    /// This node's id on the ring. Must be non-zero.
    #[arg(long)]
    node_id: u32,

    /// Multicast group address shared by every node in the ring.
    #[arg(long, default_value = "239.2.11.1")]
    mcast_addr: Ipv4Addr,

    /// Multicast group port.
    #[arg(long, default_value_t = totem_srp::config::DEFAULT_MCAST_PORT)]
    mcast_port: u16,

    /// Local interface to bind on; autodetected if omitted.
    #[arg(long)]
    bind_iface: Option<Ipv4Addr>,

    /// Shared secret used to derive the frame codec's per-frame keys.
    /// Every node in the ring must use the same value.
    #[arg(long, default_value = "totem-demo-shared-secret")]
    key: String,

    /// Path to the persisted ring-sequence file for this node.
    #[arg(long)]
    persist_path: PathBuf,

    /// Known peer as `node_id=host:port`; repeat for every other node in
    /// the candidate ring, including ones not yet up.
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(u32, SocketAddr)>,

    /// Token-loss deadline in milliseconds.
    #[arg(long, default_value_t = totem_srp::config::DEFAULT_TOKEN_TIMEOUT_MS)]
    token_timeout_ms: u32,
}

fn parse_peer(s: &str) -> Result<(u32, SocketAddr), String> {
    let (id, addr) = s.split_once('=').ok_or_else(|| format!("expected node_id=host:port, got {s}"))?;
    let id: u32 = id.parse().map_err(|e| format!("bad node id {id}: {e}"))?;
    let addr: SocketAddr = addr.parse().map_err(|e| format!("bad address {addr}: {e}"))?;
    Ok((id, addr))
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("totem-node exiting: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> totem_srp::Result<()> {
    let mut config = RingConfig::new(args.node_id, args.mcast_addr, args.key.into_bytes(), args.persist_path);
    config.mcast_port = args.mcast_port;
    config.bind_iface = args.bind_iface;
    config.token_timeout_ms = args.token_timeout_ms;

    let mut ring = RingInstance::new(config)?;
    for (id, addr) in &args.peers {
        ring.set_node_address(*id, *addr);
    }
    log::info!("[node {}] starting with {} known peer(s)", args.node_id, args.peers.len());
    ring.start()?;

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        for event in ring.poll_once(Some(Duration::from_millis(50)))? {
            log_event(args.node_id, &event);
        }

        match lines.next() {
            Some(Ok(line)) if !line.is_empty() => {
                if !ring.can_send(line.len()) {
                    log::warn!("[node {}] send queue full, dropping input line", args.node_id);
                    continue;
                }
                ring.mcast(line.into_bytes(), Guarantee::Agreed)?;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => log::warn!("[node {}] stdin read error: {e}", args.node_id),
            None => {}
        }
    }
}

fn log_event(node_id: u32, event: &RingEvent) {
    match event {
        RingEvent::Delivered(d) => {
            log::info!(
                "[node {node_id}] delivered {} bytes from {} (endian_swap={})",
                d.payload.len(),
                d.source,
                d.endian_swap_required
            );
        }
        RingEvent::MembershipChanged(chg) => {
            log::info!(
                "[node {node_id}] membership {:?}: members={:?} left={:?} joined={:?} ring={}",
                chg.config_type,
                chg.member_list,
                chg.left_list,
                chg.joined_list,
                chg.ring_id
            );
        }
    }
}
