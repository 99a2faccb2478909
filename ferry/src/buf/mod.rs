// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Pooled, reference-counted buffers with reserved front and rear headroom.
//!
//! A [Buffer] exposes a logical window (`start..end`) inside a backing block,
//! plus a logical limit. The bytes before `start` are front headroom, left for
//! a wrapping layer to prepend a header in place; the bytes a relay hands back
//! with [Buffer::over_cap] after a read are rear headroom for trailers.

use std::{fmt, io, net::SocketAddr, ops::Deref, sync::Arc};

mod pool;
pub use pool::{BufferPool, BufferPoolConfig, PoolStats};

/// Default size of a stream relay buffer when no MTU hint is available
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Default size of a packet relay buffer when no MTU hint is available
pub const UDP_BUFFER_SIZE: usize = 65_535;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Buffer has {available} bytes available where {needed} were needed")]
pub struct ShortBuffer {
  pub needed: usize,
  pub available: usize,
}

impl From<ShortBuffer> for io::Error {
  fn from(e: ShortBuffer) -> Self {
    io::Error::new(io::ErrorKind::WriteZero, e)
  }
}

#[derive(Clone)]
pub(crate) struct Block {
  data: Box<[u8]>,
}

impl Block {
  pub(crate) fn zeroed(capacity: usize) -> Self {
    Self {
      data: vec![0u8; capacity].into_boxed_slice(),
    }
  }

  pub(crate) fn capacity(&self) -> usize {
    self.data.len()
  }

  pub(crate) fn into_inner(self) -> Box<[u8]> {
    self.data
  }

  pub(crate) fn from_inner(data: Box<[u8]>) -> Self {
    Self { data }
  }
}

/// A window over a shared, possibly pooled memory block.
///
/// A buffer is exclusively owned by whoever allocated it until it is handed to
/// [Buffer::release] or [Buffer::leak]. Writers that need the memory to outlive
/// their call may [Buffer::retain] it; the block is then never recycled while
/// that view is alive, and further mutation through this buffer copies first.
///
/// Dropping a buffer detaches it from its pool the same way [Buffer::leak] does,
/// without being counted as a leak.
pub struct Buffer {
  block: Arc<Block>,
  start: usize,
  end: usize,
  limit: usize,
  size: usize,
  pool: Option<BufferPool>,
}

impl Buffer {
  /// Creates an unpooled buffer of exactly `size` bytes
  pub fn with_size(size: usize) -> Self {
    Self::from_block(Block::zeroed(size), size, None)
  }

  /// Creates an unpooled buffer holding a copy of `data`
  pub fn from_slice(data: &[u8]) -> Self {
    let mut buffer = Self::with_size(data.len());
    buffer.block_mut()[..data.len()].copy_from_slice(data);
    buffer.end = data.len();
    buffer
  }

  pub(crate) fn from_block(block: Block, size: usize, pool: Option<BufferPool>) -> Self {
    debug_assert!(size <= block.capacity());
    Self {
      block: Arc::new(block),
      start: 0,
      end: 0,
      limit: size,
      size,
      pool,
    }
  }

  fn block_mut(&mut self) -> &mut [u8] {
    &mut Arc::make_mut(&mut self.block).data
  }

  /// Offset of the first payload byte; equal to the available front headroom
  pub fn start(&self) -> usize {
    self.start
  }

  /// Length of the payload window
  pub fn len(&self) -> usize {
    self.end - self.start
  }

  pub fn is_empty(&self) -> bool {
    self.end == self.start
  }

  /// Current logical capacity, excluding any reserved rear headroom
  pub fn capacity(&self) -> usize {
    self.limit
  }

  /// Bytes which may still be written after the payload
  pub fn free_len(&self) -> usize {
    self.limit - self.end
  }

  /// Whether the backing block is currently referenced by a retained view
  pub fn is_shared(&self) -> bool {
    Arc::strong_count(&self.block) > 1
  }

  pub fn bytes(&self) -> &[u8] {
    &self.block.data[self.start..self.end]
  }

  pub fn bytes_mut(&mut self) -> &mut [u8] {
    let (start, end) = (self.start, self.end);
    &mut self.block_mut()[start..end]
  }

  /// The writable space between the payload end and the logical limit
  pub fn free_bytes_mut(&mut self) -> &mut [u8] {
    let (end, limit) = (self.end, self.limit);
    &mut self.block_mut()[end..limit]
  }

  /// Marks `n` bytes of [Buffer::free_bytes_mut] as payload
  pub fn commit(&mut self, n: usize) {
    assert!(
      n <= self.free_len(),
      "commit of {} bytes exceeds {} free",
      n,
      self.free_len()
    );
    self.end += n;
  }

  /// Appends `data` to the payload
  pub fn write_slice(&mut self, data: &[u8]) -> Result<(), ShortBuffer> {
    if data.len() > self.free_len() {
      return Err(ShortBuffer {
        needed: data.len(),
        available: self.free_len(),
      });
    }
    let end = self.end;
    self.block_mut()[end..end + data.len()].copy_from_slice(data);
    self.end += data.len();
    Ok(())
  }

  /// Claims `n` bytes of front headroom, returning them for a header to be written into
  pub fn extend_header(&mut self, n: usize) -> Result<&mut [u8], ShortBuffer> {
    if n > self.start {
      return Err(ShortBuffer {
        needed: n,
        available: self.start,
      });
    }
    self.start -= n;
    let start = self.start;
    Ok(&mut self.block_mut()[start..start + n])
  }

  /// Places the payload window at `start` with `len` bytes, without moving content
  pub fn resize(&mut self, start: usize, len: usize) {
    assert!(
      start + len <= self.limit,
      "window {}+{} exceeds capacity {}",
      start,
      len,
      self.limit
    );
    self.start = start;
    self.end = start + len;
  }

  /// Shortens the payload to `len` bytes
  pub fn truncate(&mut self, len: usize) {
    if len < self.len() {
      self.end = self.start + len;
    }
  }

  /// Withholds `n` bytes at the tail from readers, keeping them for rear headroom
  pub fn reserve(&mut self, n: usize) {
    assert!(
      self.limit >= self.end + n,
      "cannot reserve {} bytes with {} free",
      n,
      self.free_len()
    );
    self.limit -= n;
  }

  /// Hands `n` previously reserved tail bytes back to writers
  pub fn over_cap(&mut self, n: usize) {
    assert!(
      self.limit + n <= self.block.capacity(),
      "cannot restore {} bytes past the block end",
      n
    );
    self.limit += n;
  }

  /// Empties the window and drops any reservation
  pub fn reset(&mut self) {
    self.start = 0;
    self.end = 0;
    self.limit = self.size;
  }

  /// Keeps a read-only view of the payload alive independently of this buffer
  pub fn retain(&self) -> RetainedBuffer {
    RetainedBuffer {
      block: Arc::clone(&self.block),
      start: self.start,
      end: self.end,
    }
  }

  /// Returns the backing block to its pool for reuse.
  ///
  /// When another holder still references the block it is detached instead,
  /// exactly as [Buffer::leak] would.
  pub fn release(self) {
    let Buffer { block, pool, .. } = self;
    if let Some(pool) = pool {
      pool.recycle(block);
    }
  }

  /// Detaches the block from pool reuse; memory is freed once the last holder drops it
  pub fn leak(self) {
    let Buffer { block, pool, .. } = self;
    if let Some(pool) = pool {
      pool.record_leak();
    }
    drop(block);
  }
}

impl fmt::Debug for Buffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Buffer")
      .field("start", &self.start)
      .field("len", &self.len())
      .field("capacity", &self.limit)
      .field("pooled", &self.pool.is_some())
      .finish()
  }
}

/// A read-only payload view that keeps its block out of pool rotation while alive
#[derive(Clone)]
pub struct RetainedBuffer {
  block: Arc<Block>,
  start: usize,
  end: usize,
}

impl RetainedBuffer {
  pub fn bytes(&self) -> &[u8] {
    &self.block.data[self.start..self.end]
  }
}

impl Deref for RetainedBuffer {
  type Target = [u8];

  fn deref(&self) -> &[u8] {
    self.bytes()
  }
}

impl AsRef<[u8]> for RetainedBuffer {
  fn as_ref(&self) -> &[u8] {
    self.bytes()
  }
}

impl fmt::Debug for RetainedBuffer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetainedBuffer")
      .field("len", &(self.end - self.start))
      .finish()
  }
}

/// A datagram payload paired with its destination
#[derive(Debug)]
pub struct PacketBuffer {
  pub buffer: Buffer,
  pub destination: SocketAddr,
}

impl PacketBuffer {
  pub fn new(buffer: Buffer, destination: SocketAddr) -> Self {
    Self {
      buffer,
      destination,
    }
  }
}
