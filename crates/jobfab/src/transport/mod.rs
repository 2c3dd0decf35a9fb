// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Socket-level plumbing: framing, per-peer stream sockets, the
//! range-bound listener, and the discovery datagram sender.

pub mod datagram;
pub mod frame;
pub mod listener;
pub mod stream;

pub use datagram::DatagramSocket;
pub use frame::{FrameCodec, FRAME_HEADER_SIZE};
pub use listener::StreamListener;
pub use stream::{connect_with_source_port, SocketHandler, StreamSocket};
