// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Transparent wrappers which a relay peels off before choosing a copy strategy.
//!
//! Used directly, each wrapper behaves like its inner endpoint (counting or
//! replaying its cache as it goes). Inside a relay, its counter or cache is
//! collected through `upstream` and applied by the relay itself.

use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use super::network::{
  CountFunc, PacketReader, PacketReaderLayer, PacketWriter, PacketWriterLayer, ReaderLayer,
  StreamReader, StreamWriter, WriterLayer,
};
use crate::buf::{Buffer, PacketBuffer};

fn count_func(counter: impl Fn(u64) + Send + Sync + 'static) -> CountFunc {
  Arc::new(counter)
}

/// Reports every chunk read through it to a counter
pub struct CountingReader<R> {
  inner: R,
  counter: CountFunc,
}

impl<R: StreamReader> CountingReader<R> {
  pub fn new(inner: R, counter: impl Fn(u64) + Send + Sync + 'static) -> Self {
    Self {
      inner,
      counter: count_func(counter),
    }
  }

  pub fn into_inner(self) -> R {
    self.inner
  }
}

impl<R: StreamReader> StreamReader for CountingReader<R> {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let n = self.inner.read_buffer(buffer).await?;
      if n > 0 {
        (self.counter)(n as u64);
      }
      Ok(n)
    }
    .boxed()
  }

  fn upstream(&mut self) -> ReaderLayer<'_> {
    ReaderLayer::Counted {
      counter: Arc::clone(&self.counter),
      inner: &mut self.inner,
    }
  }

  fn read_mtu(&self) -> Option<usize> {
    self.inner.read_mtu()
  }
}

/// Reports every chunk written through it to a counter
pub struct CountingWriter<W> {
  inner: W,
  counter: CountFunc,
}

impl<W: StreamWriter> CountingWriter<W> {
  pub fn new(inner: W, counter: impl Fn(u64) + Send + Sync + 'static) -> Self {
    Self {
      inner,
      counter: count_func(counter),
    }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

impl<W: StreamWriter> StreamWriter for CountingWriter<W> {
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    async move {
      let n = buffer.len() as u64;
      self.inner.write_buffer(buffer).await?;
      (self.counter)(n);
      Ok(())
    }
    .boxed()
  }

  fn upstream(&mut self) -> WriterLayer<'_> {
    WriterLayer::Counted {
      counter: Arc::clone(&self.counter),
      inner: &mut self.inner,
    }
  }

  fn front_headroom(&self) -> usize {
    self.inner.front_headroom()
  }

  fn rear_headroom(&self) -> usize {
    self.inner.rear_headroom()
  }

  fn write_mtu(&self) -> Option<usize> {
    self.inner.write_mtu()
  }
}

pub struct CountingPacketReader<R> {
  inner: R,
  counter: CountFunc,
}

impl<R: PacketReader> CountingPacketReader<R> {
  pub fn new(inner: R, counter: impl Fn(u64) + Send + Sync + 'static) -> Self {
    Self {
      inner,
      counter: count_func(counter),
    }
  }
}

impl<R: PacketReader> PacketReader for CountingPacketReader<R> {
  fn read_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
  ) -> BoxFuture<'a, io::Result<SocketAddr>> {
    async move {
      let before = buffer.len();
      let destination = self.inner.read_packet(buffer).await?;
      (self.counter)((buffer.len() - before) as u64);
      Ok(destination)
    }
    .boxed()
  }

  fn upstream(&mut self) -> PacketReaderLayer<'_> {
    PacketReaderLayer::Counted {
      counter: Arc::clone(&self.counter),
      inner: &mut self.inner,
    }
  }

  fn read_mtu(&self) -> Option<usize> {
    self.inner.read_mtu()
  }
}

pub struct CountingPacketWriter<W> {
  inner: W,
  counter: CountFunc,
}

impl<W: PacketWriter> CountingPacketWriter<W> {
  pub fn new(inner: W, counter: impl Fn(u64) + Send + Sync + 'static) -> Self {
    Self {
      inner,
      counter: count_func(counter),
    }
  }
}

impl<W: PacketWriter> PacketWriter for CountingPacketWriter<W> {
  fn write_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
    destination: SocketAddr,
  ) -> BoxFuture<'a, io::Result<()>> {
    async move {
      let n = buffer.len() as u64;
      self.inner.write_packet(buffer, destination).await?;
      (self.counter)(n);
      Ok(())
    }
    .boxed()
  }

  fn upstream(&mut self) -> PacketWriterLayer<'_> {
    PacketWriterLayer::Counted {
      counter: Arc::clone(&self.counter),
      inner: &mut self.inner,
    }
  }

  fn front_headroom(&self) -> usize {
    self.inner.front_headroom()
  }

  fn rear_headroom(&self) -> usize {
    self.inner.rear_headroom()
  }

  fn write_mtu(&self) -> Option<usize> {
    self.inner.write_mtu()
  }
}

/// A reader holding data consumed ahead of time, such as bytes sniffed during a handshake.
///
/// The cached chunks are produced before anything read from `inner`.
pub struct CachedReader<R> {
  inner: R,
  cached: VecDeque<Buffer>,
}

impl<R: StreamReader> CachedReader<R> {
  pub fn new(inner: R, cached: impl IntoIterator<Item = Buffer>) -> Self {
    Self {
      inner,
      cached: cached.into_iter().filter(|b| !b.is_empty()).collect(),
    }
  }
}

impl<R: StreamReader> StreamReader for CachedReader<R> {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      let Some(chunk) = self.cached.front_mut() else {
        return self.inner.read_buffer(buffer).await;
      };
      let n = chunk.len().min(buffer.free_len());
      buffer.write_slice(&chunk.bytes()[..n])?;
      if n == chunk.len() {
        if let Some(drained) = self.cached.pop_front() {
          drained.release();
        }
      } else {
        let (start, len) = (chunk.start(), chunk.len());
        chunk.resize(start + n, len - n);
      }
      Ok(n)
    }
    .boxed()
  }

  fn upstream(&mut self) -> ReaderLayer<'_> {
    ReaderLayer::Cached {
      cached: std::mem::take(&mut self.cached),
      inner: &mut self.inner,
    }
  }

  fn read_mtu(&self) -> Option<usize> {
    self.inner.read_mtu()
  }
}

/// A packet reader replaying datagrams received before the relay started
pub struct CachedPacketReader<R> {
  inner: R,
  cached: VecDeque<PacketBuffer>,
}

impl<R: PacketReader> CachedPacketReader<R> {
  pub fn new(inner: R, cached: impl IntoIterator<Item = PacketBuffer>) -> Self {
    Self {
      inner,
      cached: cached.into_iter().collect(),
    }
  }
}

impl<R: PacketReader> PacketReader for CachedPacketReader<R> {
  fn read_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
  ) -> BoxFuture<'a, io::Result<SocketAddr>> {
    async move {
      let Some(packet) = self.cached.pop_front() else {
        return self.inner.read_packet(buffer).await;
      };
      let copied = buffer.write_slice(packet.buffer.bytes());
      let destination = packet.destination;
      packet.buffer.release();
      copied?;
      Ok(destination)
    }
    .boxed()
  }

  fn upstream(&mut self) -> PacketReaderLayer<'_> {
    PacketReaderLayer::Cached {
      cached: std::mem::take(&mut self.cached),
      inner: &mut self.inner,
    }
  }

  fn read_mtu(&self) -> Option<usize> {
    self.inner.read_mtu()
  }
}
