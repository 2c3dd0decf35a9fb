// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! The dispatch engine: the shared inbox and the packet-kind table.

pub mod dispatch;
pub mod inbox;

pub use dispatch::{DispatchTable, Handler};
pub use inbox::{Inbox, Message, PopOutcome};
