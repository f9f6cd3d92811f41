// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking unreliable datagram transport: one multicast socket for
//! message/token broadcast traffic, one unicast socket for directed
//! token-to-successor hops. Both sockets are registered with the event
//! loop's `mio::Poll` instance and are never touched outside it.

use crate::config::RingConfig;
use crate::error::{Error, Result};
use mio::net::UdpSocket as MioUdpSocket;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};

/// `mio::Token` assigned to the multicast socket's poll registration.
pub const MCAST_TOKEN: mio::Token = mio::Token(0);
/// `mio::Token` assigned to the unicast token-hop socket's poll registration.
pub const UNICAST_TOKEN: mio::Token = mio::Token(1);

fn bind_addr(config: &RingConfig, port: u16) -> SocketAddrV4 {
    let iface = config.bind_iface.unwrap_or(Ipv4Addr::UNSPECIFIED);
    SocketAddrV4::new(iface, port)
}

/// Join the configured multicast group on every discovered non-loopback
/// interface, falling back to `UNSPECIFIED` if none are found.
fn join_multicast_group(socket: &StdUdpSocket, group: Ipv4Addr, bind_iface: Option<Ipv4Addr>) -> Result<()> {
    let interfaces: Vec<Ipv4Addr> = match bind_iface {
        Some(addr) => vec![addr],
        None => discover_interfaces(),
    };

    if interfaces.is_empty() {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::MulticastJoinFailed(e.to_string()))?;
        log::debug!("[transport] joined {} on UNSPECIFIED", group);
        return Ok(());
    }

    for iface in interfaces {
        match socket.join_multicast_v4(&group, &iface) {
            Ok(()) => log::debug!("[transport] joined {} on {}", group, iface),
            Err(e) if e.raw_os_error() == Some(98) => {
                log::debug!("[transport] {} already joined on {}", group, iface);
            }
            Err(e) => log::debug!("[transport] join {} on {} failed (non-fatal): {}", group, iface, e),
        }
    }
    socket.set_multicast_loop_v4(true)?;
    Ok(())
}

pub(crate) fn discover_interfaces() -> Vec<Ipv4Addr> {
    use std::net::IpAddr;

    if let Ok(var) = std::env::var("TOTEM_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            return vec![addr];
        }
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[transport] failed to list interfaces: {}", e);
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

/// The two non-blocking sockets the event loop owns: multicast broadcast
/// and unicast token-hop.
pub struct DatagramTransport {
    pub mcast: MioUdpSocket,
    pub unicast: MioUdpSocket,
    pub mcast_group_addr: SocketAddr,
}

impl DatagramTransport {
    /// Bind both sockets and join the configured multicast group. Both
    /// sockets are set non-blocking by `mio` on registration.
    pub fn bind(config: &RingConfig) -> Result<Self> {
        let mcast_std = {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            let addr = bind_addr(config, config.mcast_port);
            socket
                .bind(&addr.into())
                .map_err(|e| Error::BindFailed(e.to_string()))?;
            socket.set_nonblocking(true)?;
            let std_socket: StdUdpSocket = socket.into();
            join_multicast_group(&std_socket, config.mcast_addr, config.bind_iface)?;
            std_socket
        };

        let unicast_std = {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            let addr = bind_addr(config, 0);
            socket
                .bind(&addr.into())
                .map_err(|e| Error::BindFailed(e.to_string()))?;
            socket.set_nonblocking(true)?;
            socket.into()
        };

        Ok(Self {
            mcast: MioUdpSocket::from_std(mcast_std),
            unicast: MioUdpSocket::from_std(unicast_std),
            mcast_group_addr: SocketAddr::V4(SocketAddrV4::new(config.mcast_addr, config.mcast_port)),
        })
    }

    /// Register both sockets with `poll`.
    pub fn register(&mut self, poll: &mio::Poll) -> Result<()> {
        poll.registry()
            .register(&mut self.mcast, MCAST_TOKEN, mio::Interest::READABLE)?;
        poll.registry()
            .register(&mut self.unicast, UNICAST_TOKEN, mio::Interest::READABLE)?;
        Ok(())
    }

    /// Send `datagram` to the multicast group.
    pub fn send_mcast(&self, datagram: &[u8]) -> Result<()> {
        self.mcast.send_to(datagram, self.mcast_group_addr)?;
        Ok(())
    }

    /// Send `datagram` directly to a successor's unicast token address.
    pub fn send_token(&self, datagram: &[u8], to: SocketAddr) -> Result<()> {
        self.unicast.send_to(datagram, to)?;
        Ok(())
    }

    /// Drain every pending datagram on the multicast socket,
    /// non-blocking. Returns once `EWOULDBLOCK` is observed.
    pub fn drain_mcast(&self, mut on_datagram: impl FnMut(&[u8], SocketAddr)) -> Result<()> {
        let mut buf = [0u8; 65536];
        loop {
            match self.mcast.recv_from(&mut buf) {
                Ok((n, from)) => on_datagram(&buf[..n], from),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// The local address of the unicast token-hop socket, with an
    /// unspecified bind IP normalized to loopback. Used to address this
    /// node itself when it is its own successor (a single-member ring).
    pub fn unicast_local_addr(&self) -> Result<SocketAddr> {
        let addr = self.unicast.local_addr()?;
        Ok(match addr {
            SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, v4.port()))
            }
            other => other,
        })
    }

    /// Receive a single pending token datagram, if any.
    pub fn try_recv_token(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.unicast.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
