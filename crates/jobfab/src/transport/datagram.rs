// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Broadcast-capable UDP socket for worker discovery.
//!
//! Discovery is subnet broadcast, not multicast: idle services listen on a
//! fixed port range and the master sprays its advertisement at every port
//! in that range. In patch mode the spray is replaced by targeted unicast
//! to an explicit machine list.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

/// UDP sender bound to an ephemeral port with SO_BROADCAST enabled.
pub struct DatagramSocket {
    socket: UdpSocket,
}

impl DatagramSocket {
    /// Bind an ephemeral port and enable broadcast.
    pub fn bind_any() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        let addr: SocketAddr = "0.0.0.0:0".parse().expect("static bind address");
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();

        match local_ip_address::local_ip() {
            Ok(ip) => log::debug!("[BCAST] discovery socket up, local ip {}", ip),
            Err(e) => log::debug!("[BCAST] discovery socket up, local ip unknown ({})", e),
        }
        Ok(Self { socket })
    }

    /// Send `payload` to the limited-broadcast address on `port`.
    pub fn broadcast_to_port(&self, payload: &[u8], port: u16) -> io::Result<()> {
        let dest = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
        self.socket.send_to(payload, dest)?;
        Ok(())
    }

    /// Send `payload` to one specific machine on `port` (patch mode).
    pub fn send_to(&self, payload: &[u8], ip: Ipv4Addr, port: u16) -> io::Result<()> {
        self.socket.send_to(payload, SocketAddrV4::new(ip, port))?;
        Ok(())
    }
}
