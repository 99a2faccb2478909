// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Bidirectional relaying between connections, biased towards zero-copy transfer.

pub mod buf;
pub mod common;
pub mod config;
pub mod relay;
pub mod util;

pub use buf::{Buffer, BufferPool, PacketBuffer};
pub use common::error::{Direction, RelayError, Relayed};
pub use relay::{copy, copy_conn, copy_packet, copy_packet_conn};
