// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fmt, io};

/// Which half of a duplex relay produced a result
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
  /// First endpoint towards the second
  Upload,
  /// Second endpoint towards the first
  Download,
}

impl Direction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Direction::Upload => "upload",
      Direction::Download => "download",
    }
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  /// The destination refused the very first chunk; the endpoints never exchanged data
  #[error("Handshake failure: {0}")]
  HandshakeFailure(#[source] io::Error),
  #[error(transparent)]
  Io(#[from] io::Error),
  #[error("Decorator chain exceeds {0} layers")]
  ChainTooDeep(usize),
  #[error("Relay task failed: {0}")]
  Task(String),
  #[error("{direction}: {source}")]
  Directional {
    direction: Direction,
    source: Box<RelayError>,
  },
}

impl RelayError {
  pub fn with_direction(self, direction: Direction) -> Self {
    RelayError::Directional {
      direction,
      source: Box::new(self),
    }
  }

  /// The direction label attached by a duplex relay, if any
  pub fn direction(&self) -> Option<Direction> {
    match self {
      RelayError::Directional { direction, .. } => Some(*direction),
      _ => None,
    }
  }

  /// The error beneath any direction label
  pub fn cause(&self) -> &RelayError {
    match self {
      RelayError::Directional { source, .. } => source.cause(),
      other => other,
    }
  }

  pub fn is_handshake_failure(&self) -> bool {
    matches!(self.cause(), RelayError::HandshakeFailure(_))
  }

  /// Kind of the underlying I/O failure, if the error came from an endpoint
  pub fn io_kind(&self) -> Option<io::ErrorKind> {
    match self.cause() {
      RelayError::HandshakeFailure(e) | RelayError::Io(e) => Some(e.kind()),
      _ => None,
    }
  }
}

/// The outcome of one relay direction: bytes moved, and the error that ended it, if any.
///
/// Bytes are reported even when the relay failed.
#[derive(Debug, Default)]
#[must_use]
pub struct Relayed {
  pub bytes: u64,
  pub error: Option<RelayError>,
}

impl Relayed {
  pub fn done(bytes: u64) -> Self {
    Self { bytes, error: None }
  }

  pub fn failed(bytes: u64, error: impl Into<RelayError>) -> Self {
    Self {
      bytes,
      error: Some(error.into()),
    }
  }

  pub fn is_ok(&self) -> bool {
    self.error.is_none()
  }

  /// Credits bytes moved by an earlier stage of the same relay
  pub(crate) fn after(mut self, earlier: u64) -> Self {
    self.bytes += earlier;
    self
  }

  pub fn into_result(self) -> Result<u64, RelayError> {
    match self.error {
      None => Ok(self.bytes),
      Some(e) => Err(e),
    }
  }
}
