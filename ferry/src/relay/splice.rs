// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Kernel-side transfer between two sockets through an intermediate pipe.

use super::unwrap::Counters;
use crate::common::{error::Relayed, network::RawConn};

/// Moves bytes from `source` to `destination` without copying them through user space.
///
/// Resolves to `None` when the platform or socket pair cannot be spliced and
/// nothing was transferred yet, leaving the relay to pick another strategy.
/// `delivered_any` reports whether earlier stages already wrote to `destination`.
#[cfg(target_os = "linux")]
pub(crate) async fn copy_direct(
  source: RawConn<'_>,
  destination: RawConn<'_>,
  counters: &Counters,
  delivered_any: bool,
) -> Option<Relayed> {
  linux::copy_direct(source, destination, counters, delivered_any).await
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn copy_direct(
  _source: RawConn<'_>,
  _destination: RawConn<'_>,
  _counters: &Counters,
  _delivered_any: bool,
) -> Option<Relayed> {
  None
}

#[cfg(target_os = "linux")]
mod linux {
  use std::{
    io,
    os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
  };

  use tokio::io::Interest;

  use super::Counters;
  use crate::{
    common::{error::Relayed, network::RawConn},
    relay::write_failure,
  };

  /// Default pipe capacity on Linux
  const PIPE_CHUNK: usize = 64 * 1024;

  struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
  }

  impl Pipe {
    fn new() -> io::Result<Self> {
      let mut fds: [libc::c_int; 2] = [-1; 2];
      // SAFETY: `fds` is a valid, writable array of two descriptors, as pipe2 requires.
      let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
      if rc < 0 {
        return Err(io::Error::last_os_error());
      }
      // SAFETY: pipe2 succeeded, so both descriptors are open and owned by nobody else.
      let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
      Ok(Self { read, write })
    }
  }

  fn splice(from: RawFd, to: RawFd, len: usize) -> io::Result<usize> {
    // SAFETY: both descriptors stay open for the duration of the call, and null
    // offsets make the kernel use (and advance) each descriptor's own position.
    let n = unsafe {
      libc::splice(
        from,
        ptr::null_mut(),
        to,
        ptr::null_mut(),
        len,
        libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
      )
    };
    if n < 0 {
      Err(io::Error::last_os_error())
    } else {
      Ok(n as usize)
    }
  }

  /// Errors meaning this pair of descriptors cannot be spliced at all
  fn is_unsupported(error: &io::Error) -> bool {
    matches!(
      error.raw_os_error(),
      Some(libc::EINVAL | libc::ENOSYS | libc::EOPNOTSUPP | libc::EXDEV)
    )
  }

  async fn fill(source: &RawConn<'_>, pipe: RawFd) -> io::Result<usize> {
    let fd = source.as_raw_fd();
    loop {
      source.readable().await?;
      match source.try_io(Interest::READABLE, || splice(fd, pipe, PIPE_CHUNK)) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        result => return result,
      }
    }
  }

  async fn drain(destination: &RawConn<'_>, pipe: RawFd, mut pending: usize) -> io::Result<()> {
    let fd = destination.as_raw_fd();
    while pending > 0 {
      destination.writable().await?;
      match destination.try_io(Interest::WRITABLE, || splice(pipe, fd, pending)) {
        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => pending -= n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  #[tracing::instrument(level = "trace", skip_all, fields(source = source.as_raw_fd(), destination = destination.as_raw_fd()))]
  pub(super) async fn copy_direct(
    source: RawConn<'_>,
    destination: RawConn<'_>,
    counters: &Counters,
    delivered_any: bool,
  ) -> Option<Relayed> {
    let pipe = match Pipe::new() {
      Ok(pipe) => pipe,
      Err(e) => {
        tracing::debug!(error = %e, "Pipe creation failed; splice unavailable");
        return None;
      }
    };
    let mut total = 0u64;
    loop {
      let n = match fill(&source, pipe.write.as_raw_fd()).await {
        Ok(0) => return Some(Relayed::done(total)),
        Ok(n) => n,
        Err(e) if total == 0 && is_unsupported(&e) => {
          tracing::debug!(error = %e, "Socket pair cannot be spliced");
          return None;
        }
        Err(e) => return Some(Relayed::failed(total, e)),
      };
      // bytes sitting in the pipe are already consumed from the source
      if let Err(e) = drain(&destination, pipe.read.as_raw_fd(), n).await {
        return Some(Relayed::failed(total, write_failure(e, delivered_any || total > 0)));
      }
      total += n as u64;
      counters.count(n as u64);
    }
  }
}
