// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relay cores and the duplex orchestrator.
//!
//! A single-direction relay peels decorators off both ends, drains cached
//! data, then picks the cheapest transfer the transports allow: kernel
//! splicing, then read-wait, then a pooled copy loop.

use std::io;

use crate::common::error::RelayError;

pub mod duplex;
pub mod packet;
mod splice;
pub mod stream;
mod unwrap;
mod wait;

pub use duplex::{copy_conn, copy_packet_conn};
pub use packet::{copy_packet, copy_packet_with_pool};
pub use stream::{copy, copy_with_buffer, copy_with_pool};
pub use unwrap::MAX_UNWRAP_DEPTH;

/// Classifies a destination write failure.
///
/// Before any chunk reached the destination, the failure means the two ends
/// never exchanged data, which callers treat as a failed handshake.
pub(crate) fn write_failure(error: io::Error, delivered_any: bool) -> RelayError {
  if delivered_any {
    RelayError::Io(error)
  } else {
    RelayError::HandshakeFailure(error)
  }
}
