// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Worker discovery: the master's broadcast-and-admit loop.

pub mod broadcaster;

pub use broadcaster::Broadcaster;
