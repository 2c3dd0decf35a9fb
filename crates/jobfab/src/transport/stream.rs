// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! One established TCP peer wrapped as a message source/sink.
//!
//! A [`StreamSocket`] owns the connection: sends are framed and written
//! inline under a writer lock (one stream write per logical send, so
//! concurrent senders never interleave frames), and a dedicated reader
//! thread decodes inbound frames and hands them to a [`SocketHandler`].
//!
//! The handler runs on the reader thread. It must only record-and-signal
//! (enqueue the message, note the error) - never call back into
//! application code, which would re-enter the fabric from an I/O thread.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::MAX_FRAME_SIZE;
use crate::transport::frame::FrameCodec;

/// Receives frames and failures from a [`StreamSocket`]'s reader thread.
pub trait SocketHandler: Send + Sync + 'static {
    /// A complete framed message arrived. Called on the reader thread;
    /// must not block beyond enqueueing.
    fn on_message(&self, payload: Vec<u8>);

    /// The stream broke. Called at most once, on an I/O thread. The
    /// reason is human-readable.
    fn on_error(&self, reason: &str);
}

/// A live, framed TCP connection.
pub struct StreamSocket {
    writer: Mutex<TcpStream>,
    remote: SocketAddr,
    /// No further sends (set on local close and on any stream failure).
    closed: AtomicBool,
    /// We closed on purpose - suppresses the error callback.
    local_close: AtomicBool,
    error_notified: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSocket {
    /// Take ownership of `stream` and start its reader thread.
    pub fn start(
        stream: TcpStream,
        handler: Arc<dyn SocketHandler>,
    ) -> std::io::Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let read_half = stream.try_clone()?;

        let socket = Arc::new(Self {
            writer: Mutex::new(stream),
            remote,
            closed: AtomicBool::new(false),
            local_close: AtomicBool::new(false),
            error_notified: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let rx_socket = Arc::clone(&socket);
        let handle = thread::Builder::new()
            .name(format!("jobfab-rx-{}", remote))
            .spawn(move || rx_socket.read_loop(read_half, &handler))?;
        *socket.reader.lock() = Some(handle);

        Ok(socket)
    }

    /// Peer address this socket talks to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// True once the connection broke or was closed locally.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frame and write one message. Returns `false` (without touching the
    /// stream) once the connection is closed. Never blocks the caller
    /// beyond kernel send buffering.
    pub fn send(&self, payload: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.write_all(&FrameCodec::encode(payload))
    }

    /// Frame several messages and push them in a single stream write, so
    /// the receiver sees them back to back with no interleaving.
    pub fn send_batch<B: AsRef<[u8]>>(&self, payloads: &[B]) -> bool {
        if self.is_closed() {
            return false;
        }
        if payloads.is_empty() {
            return true;
        }
        self.write_all(&FrameCodec::encode_batch(payloads))
    }

    /// Close both directions. The reader thread drains out; pending sends
    /// on other threads turn into no-ops.
    pub fn close(&self) {
        self.local_close.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn write_all(&self, bytes: &[u8]) -> bool {
        let mut stream = self.writer.lock();
        match stream.write_all(bytes) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("[TCP] write to {} failed: {}", self.remote, e);
                self.closed.store(true, Ordering::Release);
                // Wake the reader so the error surfaces exactly once.
                let _ = stream.shutdown(Shutdown::Both);
                false
            }
        }
    }

    fn read_loop(&self, mut stream: TcpStream, handler: &Arc<dyn SocketHandler>) {
        let mut codec = FrameCodec::new(MAX_FRAME_SIZE);
        loop {
            match codec.decode(&mut stream) {
                Ok(Some(payload)) => handler.on_message(payload),
                // Blocking socket: None only shows up if someone flips the
                // stream non-blocking underneath us. Treat it as a spin.
                Ok(None) => continue,
                Err(e) => {
                    self.closed.store(true, Ordering::Release);
                    if !self.local_close.load(Ordering::Acquire)
                        && !self.error_notified.swap(true, Ordering::AcqRel)
                    {
                        handler.on_error(&e.to_string());
                    }
                    return;
                }
            }
        }
    }
}

impl Drop for StreamSocket {
    fn drop(&mut self) {
        self.local_close.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
    }
}

/// Connect to `remote`, binding the source port to the first free port in
/// `[first, last]`. The master classifies a peer as worker or
/// downloader-only from this source port.
pub fn connect_with_source_port(
    remote: SocketAddr,
    first: u16,
    last: u16,
) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for port in first..=last {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let bind_addr: SocketAddr = format!("0.0.0.0:{port}")
            .parse()
            .expect("static bind address");
        if let Err(e) = socket.bind(&bind_addr.into()) {
            last_err = Some(e);
            continue;
        }
        match socket.connect(&remote.into()) {
            Ok(()) => return Ok(socket.into()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free source port in [{first}, {last}]"),
        )
    }))
}
