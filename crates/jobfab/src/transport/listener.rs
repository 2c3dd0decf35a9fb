// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Range-bound TCP listener with non-blocking accept.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

/// A listener bound to the first free port of a configured range.
///
/// Accepts are polled from the broadcaster tick, so the socket runs
/// non-blocking from the start.
pub struct StreamListener {
    listener: TcpListener,
    port: u16,
}

impl StreamListener {
    /// Try each port in `[first, last]` and bind the first free one.
    ///
    /// Returns `Err` with the last bind failure when the whole range is
    /// taken - for the master that is a fatal setup condition.
    pub fn bind_in_range(first: u16, last: u16) -> io::Result<Self> {
        let mut last_err = None;
        for port in first..=last {
            match Self::bind_port(port) {
                Ok(listener) => {
                    log::debug!("[TCP] listener bound on port {}", port);
                    return Ok(Self { listener, port });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("no free listen port in [{first}, {last}]"),
            )
        }))
    }

    fn bind_port(port: u16) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("static bind address");
        socket.bind(&addr.into())?;
        socket.listen(16)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    /// Port this listener ended up on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one pending connection, if any. The returned stream is
    /// switched back to blocking mode for its reader thread.
    pub fn poll_accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                Ok(Some((stream, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
