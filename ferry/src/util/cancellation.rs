// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Shared close signal for one endpoint of a duplex relay.
///
/// Closing is idempotent; every clone observes the first close.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
  token: CancellationToken,
}

impl CloseHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn close(&self) {
    self.token.cancel()
  }

  pub fn closed(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

/// The error a pump reports when its endpoint was closed underneath it
pub fn closed_error() -> io::Error {
  io::Error::new(io::ErrorKind::ConnectionAborted, "use of closed connection")
}
