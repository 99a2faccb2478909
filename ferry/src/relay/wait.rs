// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relay loops for sources that fill destination-shaped buffers themselves.

use std::io;

use super::{unwrap::Counters, write_failure};
use crate::common::{
  error::Relayed,
  network::{PacketReadWaiter, PacketWriter, ReadWaiter, StreamWriter},
};

pub(crate) enum WaitOutcome {
  /// The relay ran to completion or failure
  Handled(Relayed),
  /// The source declined read-wait after moving `bytes`; the generic loop takes over
  NotHandled { bytes: u64 },
}

pub(crate) async fn copy_wait(
  destination: &mut dyn StreamWriter,
  source: &mut dyn ReadWaiter,
  counters: &Counters,
  mut delivered_any: bool,
) -> WaitOutcome {
  let mut total = 0u64;
  loop {
    let mut buffer = match source.wait_read_buffer().await {
      Ok(Some(buffer)) => buffer,
      Ok(None) => return WaitOutcome::Handled(Relayed::done(total)),
      Err(e) if e.kind() == io::ErrorKind::Unsupported => {
        return WaitOutcome::NotHandled { bytes: total }
      }
      Err(e) => return WaitOutcome::Handled(Relayed::failed(total, e)),
    };
    let n = buffer.len() as u64;
    if let Err(e) = destination.write_buffer(&mut buffer).await {
      buffer.leak();
      return WaitOutcome::Handled(Relayed::failed(total, write_failure(e, delivered_any)));
    }
    buffer.release();
    total += n;
    counters.count(n);
    delivered_any = true;
  }
}

pub(crate) async fn copy_packet_wait(
  destination: &mut dyn PacketWriter,
  source: &mut dyn PacketReadWaiter,
  counters: &Counters,
  mut delivered_any: bool,
) -> WaitOutcome {
  let mut total = 0u64;
  loop {
    let (mut buffer, target) = match source.wait_read_packet().await {
      Ok(packet) => packet,
      Err(e) if e.kind() == io::ErrorKind::Unsupported => {
        return WaitOutcome::NotHandled { bytes: total }
      }
      Err(e) => return WaitOutcome::Handled(Relayed::failed(total, e)),
    };
    let n = buffer.len() as u64;
    if let Err(e) = destination.write_packet(&mut buffer, target).await {
      buffer.leak();
      return WaitOutcome::Handled(Relayed::failed(total, write_failure(e, delivered_any)));
    }
    buffer.release();
    total += n;
    counters.count(n);
    delivered_any = true;
  }
}

#[cfg(test)]
mod tests {
  use std::{collections::VecDeque, io};

  use futures::{future::BoxFuture, FutureExt};

  use super::{copy_wait, WaitOutcome};
  use crate::{
    buf::{Buffer, BufferPool, BufferPoolConfig},
    common::{
      conn::IoWriter,
      error::RelayError,
      network::{ReadWaitOptions, ReadWaiter, StreamWriter},
    },
    relay::unwrap::Counters,
  };

  /// Hands out queued chunks, then declines further read-wait
  struct Scripted {
    chunks: VecDeque<&'static [u8]>,
  }

  impl ReadWaiter for Scripted {
    fn initialize_read_waiter(&mut self, _: ReadWaitOptions) -> bool {
      false
    }

    fn wait_read_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<Buffer>>> {
      let next = match self.chunks.pop_front() {
        Some(chunk) => Ok(Some(Buffer::from_slice(chunk))),
        None => Err(io::ErrorKind::Unsupported.into()),
      };
      futures::future::ready(next).boxed()
    }
  }

  #[tokio::test]
  async fn unsupported_hands_back_progress() {
    let mut source = Scripted {
      chunks: VecDeque::from(vec![&b"abc"[..], &b"de"[..]]),
    };
    let mut destination = IoWriter::new(Vec::<u8>::new());
    let outcome = copy_wait(&mut destination, &mut source, &Counters::default(), false).await;
    assert!(matches!(outcome, WaitOutcome::NotHandled { bytes: 5 }));
    assert_eq!(destination.into_inner(), b"abcde");
  }

  /// Hands out one pooled chunk per wait
  struct PooledChunks {
    pool: BufferPool,
    remaining: usize,
  }

  impl ReadWaiter for PooledChunks {
    fn initialize_read_waiter(&mut self, _: ReadWaitOptions) -> bool {
      false
    }

    fn wait_read_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<Buffer>>> {
      let next = if self.remaining == 0 {
        Ok(None)
      } else {
        self.remaining -= 1;
        let mut buffer = self.pool.allocate(64);
        buffer
          .write_slice(b"waited chunk")
          .map(|()| Some(buffer))
          .map_err(io::Error::from)
      };
      futures::future::ready(next).boxed()
    }
  }

  /// Refuses every write
  struct Refusing;

  impl StreamWriter for Refusing {
    fn write_buffer<'a>(&'a mut self, _: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
      futures::future::ready(Err(io::ErrorKind::BrokenPipe.into())).boxed()
    }
  }

  #[tokio::test]
  async fn refused_write_leaks_the_waited_buffer() {
    for delivered_any in [false, true] {
      let pool = BufferPool::new(BufferPoolConfig::default());
      let mut source = PooledChunks {
        pool: pool.clone(),
        remaining: 3,
      };
      let counters = Counters::default();
      let relayed = match copy_wait(&mut Refusing, &mut source, &counters, delivered_any).await {
        WaitOutcome::Handled(relayed) => relayed,
        WaitOutcome::NotHandled { .. } => panic!("write failure must end the relay"),
      };
      assert_eq!(relayed.bytes, 0);
      match relayed.error {
        Some(RelayError::HandshakeFailure(_)) => assert!(!delivered_any),
        Some(RelayError::Io(e)) => {
          assert!(delivered_any);
          assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
        }
        other => panic!("unexpected outcome {:?}", other),
      }
      assert_eq!(source.remaining, 2);
      assert_eq!(pool.stats().leaked, 1);
      assert_eq!(pool.idle(), 0);
    }
  }
}
