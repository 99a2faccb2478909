// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Capabilities a relay endpoint may offer.
//!
//! Every reader and writer implements a single required I/O method; the rest
//! of each trait is a set of optional capabilities with "absent" defaults. A
//! relay probes them after peeling decorator layers off via `upstream`, so a
//! wrapper only has to report what it adds, and the transport underneath it
//! decides which fast paths apply.

use std::{collections::VecDeque, io, net::SocketAddr, sync::Arc, time::Instant};

use futures::future::BoxFuture;
use tokio::io::Interest;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::buf::{Buffer, BufferPool, PacketBuffer, BUFFER_SIZE, UDP_BUFFER_SIZE};

/// Receives the size of each chunk a relay delivered
pub type CountFunc = Arc<dyn Fn(u64) + Send + Sync>;

/// One step of a reader's decorator chain
pub enum ReaderLayer<'a> {
  /// A counting wrapper; its counter sees every chunk read through it
  Counted {
    counter: CountFunc,
    inner: &'a mut dyn StreamReader,
  },
  /// A wrapper holding bytes read ahead of the relay, which must be delivered first
  Cached {
    cached: VecDeque<Buffer>,
    inner: &'a mut dyn StreamReader,
  },
  /// The transport itself
  Base(&'a mut dyn StreamReader),
}

pub enum WriterLayer<'a> {
  Counted {
    counter: CountFunc,
    inner: &'a mut dyn StreamWriter,
  },
  Base(&'a mut dyn StreamWriter),
}

pub enum PacketReaderLayer<'a> {
  Counted {
    counter: CountFunc,
    inner: &'a mut dyn PacketReader,
  },
  Cached {
    cached: VecDeque<PacketBuffer>,
    inner: &'a mut dyn PacketReader,
  },
  Base(&'a mut dyn PacketReader),
}

pub enum PacketWriterLayer<'a> {
  Counted {
    counter: CountFunc,
    inner: &'a mut dyn PacketWriter,
  },
  Base(&'a mut dyn PacketWriter),
}

pub trait AsDynStreamReader {
  fn as_dyn_reader(&mut self) -> &mut dyn StreamReader;
}

impl<T: StreamReader> AsDynStreamReader for T {
  fn as_dyn_reader(&mut self) -> &mut dyn StreamReader {
    self
  }
}

pub trait AsDynStreamWriter {
  fn as_dyn_writer(&mut self) -> &mut dyn StreamWriter;
}

impl<T: StreamWriter> AsDynStreamWriter for T {
  fn as_dyn_writer(&mut self) -> &mut dyn StreamWriter {
    self
  }
}

pub trait AsDynPacketReader {
  fn as_dyn_reader(&mut self) -> &mut dyn PacketReader;
}

impl<T: PacketReader> AsDynPacketReader for T {
  fn as_dyn_reader(&mut self) -> &mut dyn PacketReader {
    self
  }
}

pub trait AsDynPacketWriter {
  fn as_dyn_writer(&mut self) -> &mut dyn PacketWriter;
}

impl<T: PacketWriter> AsDynPacketWriter for T {
  fn as_dyn_writer(&mut self) -> &mut dyn PacketWriter {
    self
  }
}

/// A byte-stream source
pub trait StreamReader: AsDynStreamReader + Send {
  /// Reads into [Buffer::free_bytes_mut] and commits what was read.
  ///
  /// Resolves to the number of bytes added; `0` signals a clean end of input.
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>>;

  fn upstream(&mut self) -> ReaderLayer<'_> {
    ReaderLayer::Base(self.as_dyn_reader())
  }

  /// Largest chunk this source produces at once, if bounded
  fn read_mtu(&self) -> Option<usize> {
    None
  }

  /// The kernel socket beneath this reader, for splicing
  fn raw_conn(&self) -> Option<RawConn<'_>> {
    None
  }

  fn read_waiter(&mut self) -> Option<&mut dyn ReadWaiter> {
    None
  }

  /// Arms or, with `None`, clears an I/O deadline on the underlying connection
  fn set_deadline(&mut self, _deadline: Option<Instant>) {}
}

/// A byte-stream sink
pub trait StreamWriter: AsDynStreamWriter + Send {
  /// Writes the whole payload of `buffer`.
  ///
  /// The buffer stays owned by the caller; an implementation that needs its
  /// memory past this call must [Buffer::retain] it.
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>>;

  fn upstream(&mut self) -> WriterLayer<'_> {
    WriterLayer::Base(self.as_dyn_writer())
  }

  /// Bytes this writer needs in front of each payload
  fn front_headroom(&self) -> usize {
    0
  }

  /// Bytes this writer needs after each payload
  fn rear_headroom(&self) -> usize {
    0
  }

  fn write_mtu(&self) -> Option<usize> {
    None
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    None
  }

  fn as_half_close(&mut self) -> Option<&mut dyn HalfClose> {
    None
  }

  fn set_deadline(&mut self, _deadline: Option<Instant>) {}
}

/// An addressed datagram source
pub trait PacketReader: AsDynPacketReader + Send {
  /// Reads one datagram into [Buffer::free_bytes_mut], resolving to its destination
  fn read_packet<'a>(&'a mut self, buffer: &'a mut Buffer)
    -> BoxFuture<'a, io::Result<SocketAddr>>;

  fn upstream(&mut self) -> PacketReaderLayer<'_> {
    PacketReaderLayer::Base(self.as_dyn_reader())
  }

  fn read_mtu(&self) -> Option<usize> {
    None
  }

  fn packet_read_waiter(&mut self) -> Option<&mut dyn PacketReadWaiter> {
    None
  }
}

/// An addressed datagram sink
pub trait PacketWriter: AsDynPacketWriter + Send {
  fn write_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
    destination: SocketAddr,
  ) -> BoxFuture<'a, io::Result<()>>;

  fn upstream(&mut self) -> PacketWriterLayer<'_> {
    PacketWriterLayer::Base(self.as_dyn_writer())
  }

  fn front_headroom(&self) -> usize {
    0
  }

  fn rear_headroom(&self) -> usize {
    0
  }

  fn write_mtu(&self) -> Option<usize> {
    None
  }
}

impl<T: StreamReader + ?Sized> StreamReader for Box<T> {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    (**self).read_buffer(buffer)
  }

  fn upstream(&mut self) -> ReaderLayer<'_> {
    (**self).upstream()
  }

  fn read_mtu(&self) -> Option<usize> {
    (**self).read_mtu()
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    (**self).raw_conn()
  }

  fn read_waiter(&mut self) -> Option<&mut dyn ReadWaiter> {
    (**self).read_waiter()
  }

  fn set_deadline(&mut self, deadline: Option<Instant>) {
    (**self).set_deadline(deadline)
  }
}

impl<T: StreamWriter + ?Sized> StreamWriter for Box<T> {
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    (**self).write_buffer(buffer)
  }

  fn upstream(&mut self) -> WriterLayer<'_> {
    (**self).upstream()
  }

  fn front_headroom(&self) -> usize {
    (**self).front_headroom()
  }

  fn rear_headroom(&self) -> usize {
    (**self).rear_headroom()
  }

  fn write_mtu(&self) -> Option<usize> {
    (**self).write_mtu()
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    (**self).raw_conn()
  }

  fn as_half_close(&mut self) -> Option<&mut dyn HalfClose> {
    (**self).as_half_close()
  }

  fn set_deadline(&mut self, deadline: Option<Instant>) {
    (**self).set_deadline(deadline)
  }
}

impl<T: PacketReader + ?Sized> PacketReader for Box<T> {
  fn read_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
  ) -> BoxFuture<'a, io::Result<SocketAddr>> {
    (**self).read_packet(buffer)
  }

  fn upstream(&mut self) -> PacketReaderLayer<'_> {
    (**self).upstream()
  }

  fn read_mtu(&self) -> Option<usize> {
    (**self).read_mtu()
  }

  fn packet_read_waiter(&mut self) -> Option<&mut dyn PacketReadWaiter> {
    (**self).packet_read_waiter()
  }
}

impl<T: PacketWriter + ?Sized> PacketWriter for Box<T> {
  fn write_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
    destination: SocketAddr,
  ) -> BoxFuture<'a, io::Result<()>> {
    (**self).write_packet(buffer, destination)
  }

  fn upstream(&mut self) -> PacketWriterLayer<'_> {
    (**self).upstream()
  }

  fn front_headroom(&self) -> usize {
    (**self).front_headroom()
  }

  fn rear_headroom(&self) -> usize {
    (**self).rear_headroom()
  }

  fn write_mtu(&self) -> Option<usize> {
    (**self).write_mtu()
  }
}

/// Shuts down the outbound side of a connection while leaving its inbound side open
pub trait HalfClose: Send {
  fn close_write(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// A source able to fill destination-shaped buffers itself
pub trait ReadWaiter: Send {
  /// Adopts the relay's buffer layout; returns whether a generic copy is still needed
  fn initialize_read_waiter(&mut self, options: ReadWaitOptions) -> bool;

  /// Waits for the next chunk, laid out per the negotiated options.
  ///
  /// Resolves to `None` at the end of input. Timeouts surface as
  /// [io::ErrorKind::TimedOut], cancellation as [io::ErrorKind::BrokenPipe], and
  /// [io::ErrorKind::Unsupported] hands the remainder back to the generic loop.
  fn wait_read_buffer(&mut self) -> BoxFuture<'_, io::Result<Option<Buffer>>>;
}

/// The datagram counterpart of [ReadWaiter]
pub trait PacketReadWaiter: Send {
  fn initialize_read_waiter(&mut self, options: ReadWaitOptions) -> bool;

  fn wait_read_packet(&mut self) -> BoxFuture<'_, io::Result<(Buffer, SocketAddr)>>;
}

/// Buffer layout negotiated once per relay call from the destination's needs
#[derive(Debug, Clone)]
pub struct ReadWaitOptions {
  pub front_headroom: usize,
  pub rear_headroom: usize,
  pub mtu: Option<usize>,
  pool: BufferPool,
}

impl ReadWaitOptions {
  pub fn new(
    front_headroom: usize,
    rear_headroom: usize,
    mtu: Option<usize>,
    pool: BufferPool,
  ) -> Self {
    Self {
      front_headroom,
      rear_headroom,
      mtu,
      pool,
    }
  }

  pub fn pool(&self) -> &BufferPool {
    &self.pool
  }

  pub fn needs_headroom(&self) -> bool {
    self.front_headroom > 0 || self.rear_headroom > 0
  }

  pub fn stream_buffer_size(&self) -> usize {
    self.buffer_size(BUFFER_SIZE)
  }

  pub fn packet_buffer_size(&self) -> usize {
    self.buffer_size(UDP_BUFFER_SIZE)
  }

  /// Headroom never takes more than half of a default-sized buffer
  fn buffer_size(&self, default: usize) -> usize {
    let headroom = self.front_headroom + self.rear_headroom;
    match self.mtu {
      Some(mtu) => mtu + headroom,
      None if headroom <= default / 2 => default,
      None => default + headroom,
    }
  }

  /// Lays out a fresh buffer: front headroom skipped, rear headroom withheld
  fn prepare(&self, mut buffer: Buffer) -> Buffer {
    buffer.resize(self.front_headroom, 0);
    buffer.reserve(self.rear_headroom);
    buffer
  }

  pub fn new_buffer(&self) -> Buffer {
    let buffer = match self.stream_buffer_size() {
      BUFFER_SIZE => self.pool.allocate_stream(),
      size => self.pool.allocate(size),
    };
    self.prepare(buffer)
  }

  pub fn new_packet_buffer(&self) -> Buffer {
    let buffer = match self.packet_buffer_size() {
      UDP_BUFFER_SIZE => self.pool.allocate_packet(),
      size => self.pool.allocate(size),
    };
    self.prepare(buffer)
  }

  /// Restores the withheld rear headroom before the buffer is handed to the destination
  pub fn post_return(&self, buffer: &mut Buffer) {
    buffer.over_cap(self.rear_headroom);
  }
}

/// Chooses the transfer unit for a reader/writer pair: the smaller declared bound wins
pub fn calculate_mtu(read_mtu: Option<usize>, write_mtu: Option<usize>) -> Option<usize> {
  match (read_mtu, write_mtu) {
    (Some(r), Some(w)) => Some(r.min(w)),
    (r, w) => r.or(w),
  }
}

/// A kernel socket usable for zero-copy transfer
#[derive(Debug, Clone, Copy)]
pub enum RawConn<'a> {
  Tcp(&'a TcpStream),
  #[cfg(unix)]
  Unix(&'a UnixStream),
}

impl<'a> RawConn<'a> {
  #[cfg(unix)]
  pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
    use std::os::unix::io::AsRawFd;
    match self {
      RawConn::Tcp(s) => s.as_raw_fd(),
      RawConn::Unix(s) => s.as_raw_fd(),
    }
  }

  pub async fn readable(&self) -> io::Result<()> {
    match self {
      RawConn::Tcp(s) => s.readable().await,
      #[cfg(unix)]
      RawConn::Unix(s) => s.readable().await,
    }
  }

  pub async fn writable(&self) -> io::Result<()> {
    match self {
      RawConn::Tcp(s) => s.writable().await,
      #[cfg(unix)]
      RawConn::Unix(s) => s.writable().await,
    }
  }

  /// Runs a raw operation, clearing readiness if it reports [io::ErrorKind::WouldBlock]
  pub fn try_io<R>(
    &self,
    interest: Interest,
    f: impl FnOnce() -> io::Result<R>,
  ) -> io::Result<R> {
    match self {
      RawConn::Tcp(s) => s.try_io(interest, f),
      #[cfg(unix)]
      RawConn::Unix(s) => s.try_io(interest, f),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{calculate_mtu, ReadWaitOptions};
  use crate::buf::{BufferPool, BUFFER_SIZE, UDP_BUFFER_SIZE};

  #[test]
  fn mtu_negotiation() {
    assert_eq!(calculate_mtu(None, None), None);
    assert_eq!(calculate_mtu(Some(1500), None), Some(1500));
    assert_eq!(calculate_mtu(None, Some(1400)), Some(1400));
    assert_eq!(calculate_mtu(Some(9000), Some(1400)), Some(1400));
  }

  #[test]
  fn options_lay_out_headroom() {
    let options = ReadWaitOptions::new(8, 4, Some(100), BufferPool::global().clone());
    assert!(options.needs_headroom());
    let mut buffer = options.new_buffer();
    assert_eq!(buffer.start(), 8);
    assert_eq!(buffer.free_len(), 100);
    buffer.write_slice(&[1; 100]).unwrap();
    options.post_return(&mut buffer);
    assert_eq!(buffer.free_len(), 4);

    let plain = ReadWaitOptions::new(0, 0, None, BufferPool::global().clone());
    assert!(!plain.needs_headroom());
    assert_eq!(plain.stream_buffer_size(), BUFFER_SIZE);
  }

  #[test]
  fn oversized_headroom_grows_default_buffers() {
    let options = ReadWaitOptions::new(40_000, 30_000, None, BufferPool::global().clone());
    assert_eq!(options.stream_buffer_size(), BUFFER_SIZE + 70_000);
    assert_eq!(options.packet_buffer_size(), UDP_BUFFER_SIZE + 70_000);

    let mut buffer = options.new_buffer();
    assert_eq!(buffer.start(), 40_000);
    assert_eq!(buffer.free_len(), BUFFER_SIZE);
    options.post_return(&mut buffer);
    assert_eq!(buffer.free_len(), BUFFER_SIZE + 30_000);

    let buffer = options.new_packet_buffer();
    assert_eq!(buffer.free_len(), UDP_BUFFER_SIZE);
  }
}
