// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  fmt,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
  },
};

use crossbeam_queue::ArrayQueue;

use super::{Block, Buffer, BUFFER_SIZE, UDP_BUFFER_SIZE};

/// Configuration for a [BufferPool]
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
  /// Smallest size class; must be a power of two
  pub min_size: usize,
  /// Largest pooled size class; must be a power of two and >= `min_size`.
  /// Requests above it are served unpooled.
  pub max_size: usize,
  /// Idle blocks kept per size class; surplus blocks are freed on release
  pub max_per_class: usize,
}

impl Default for BufferPoolConfig {
  fn default() -> Self {
    Self {
      min_size: 1024,
      max_size: 64 * 1024,
      max_per_class: 256,
    }
  }
}

impl BufferPoolConfig {
  /// # Panics
  ///
  /// Panics if either bound is not a power of two, if `max_size < min_size`,
  /// or if `max_per_class` is zero.
  fn validate(&self) {
    assert!(
      self.min_size.is_power_of_two(),
      "min_size must be a power of two"
    );
    assert!(
      self.max_size.is_power_of_two(),
      "max_size must be a power of two"
    );
    assert!(
      self.max_size >= self.min_size,
      "max_size must be >= min_size"
    );
    assert!(self.max_per_class > 0, "max_per_class must be > 0");
  }

  fn num_classes(&self) -> usize {
    (self.max_size / self.min_size).trailing_zeros() as usize + 1
  }

  fn class_index(&self, size: usize) -> Option<usize> {
    if size > self.max_size {
      return None;
    }
    let class_size = size.max(self.min_size).next_power_of_two();
    Some((class_size / self.min_size).trailing_zeros() as usize)
  }

  fn class_size(&self, index: usize) -> usize {
    self.min_size << index
  }
}

/// Snapshot of a pool's lifetime counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  /// Buffers handed out, pooled or not
  pub allocated: u64,
  /// Allocations satisfied from an idle block
  pub reused: u64,
  /// Blocks returned to an idle list
  pub recycled: u64,
  /// Buffers detached from reuse, explicitly or because they were still shared
  pub leaked: u64,
  /// Allocations too large for any size class
  pub unpooled: u64,
}

#[derive(Default)]
struct Counters {
  allocated: AtomicU64,
  reused: AtomicU64,
  recycled: AtomicU64,
  leaked: AtomicU64,
  unpooled: AtomicU64,
}

struct PoolInner {
  config: BufferPoolConfig,
  classes: Vec<ArrayQueue<Box<[u8]>>>,
  counters: Counters,
}

/// A concurrent pool of reusable blocks, organized in power-of-two size classes.
///
/// Cloning is cheap and yields a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

impl BufferPool {
  /// # Panics
  ///
  /// Panics if the configuration is invalid.
  pub fn new(config: BufferPoolConfig) -> Self {
    config.validate();
    let classes = (0..config.num_classes())
      .map(|_| ArrayQueue::new(config.max_per_class))
      .collect();
    Self {
      inner: Arc::new(PoolInner {
        config,
        classes,
        counters: Counters::default(),
      }),
    }
  }

  /// The process-wide pool used by relays that are not given one
  pub fn global() -> &'static BufferPool {
    static GLOBAL: OnceLock<BufferPool> = OnceLock::new();
    GLOBAL.get_or_init(|| BufferPool::new(BufferPoolConfig::default()))
  }

  /// Hands out an exclusively owned buffer with a logical capacity of exactly `size`
  pub fn allocate(&self, size: usize) -> Buffer {
    let counters = &self.inner.counters;
    counters.allocated.fetch_add(1, Ordering::Relaxed);
    let config = &self.inner.config;
    match config.class_index(size) {
      Some(index) => {
        let block = match self.inner.classes[index].pop() {
          Some(data) => {
            counters.reused.fetch_add(1, Ordering::Relaxed);
            Block::from_inner(data)
          }
          None => Block::zeroed(config.class_size(index)),
        };
        Buffer::from_block(block, size, Some(self.clone()))
      }
      None => {
        counters.unpooled.fetch_add(1, Ordering::Relaxed);
        Buffer::from_block(Block::zeroed(size), size, None)
      }
    }
  }

  /// A buffer of the default stream size
  pub fn allocate_stream(&self) -> Buffer {
    self.allocate(BUFFER_SIZE)
  }

  /// A buffer of the default datagram size
  pub fn allocate_packet(&self) -> Buffer {
    self.allocate(UDP_BUFFER_SIZE)
  }

  pub fn stats(&self) -> PoolStats {
    let counters = &self.inner.counters;
    PoolStats {
      allocated: counters.allocated.load(Ordering::Relaxed),
      reused: counters.reused.load(Ordering::Relaxed),
      recycled: counters.recycled.load(Ordering::Relaxed),
      leaked: counters.leaked.load(Ordering::Relaxed),
      unpooled: counters.unpooled.load(Ordering::Relaxed),
    }
  }

  /// Number of idle blocks ready for reuse across all classes
  pub fn idle(&self) -> usize {
    self.inner.classes.iter().map(ArrayQueue::len).sum()
  }

  pub(super) fn recycle(&self, block: Arc<Block>) {
    let block = match Arc::try_unwrap(block) {
      Ok(block) => block,
      Err(_shared) => {
        // a retained view still reads this memory
        self.record_leak();
        return;
      }
    };
    let config = &self.inner.config;
    let capacity = block.capacity();
    let index = match config.class_index(capacity) {
      Some(index) if config.class_size(index) == capacity => index,
      _ => return,
    };
    if self.inner.classes[index].push(block.into_inner()).is_ok() {
      self
        .inner
        .counters
        .recycled
        .fetch_add(1, Ordering::Relaxed);
    }
  }

  pub(super) fn record_leak(&self) {
    self.inner.counters.leaked.fetch_add(1, Ordering::Relaxed);
  }
}

impl fmt::Debug for BufferPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferPool")
      .field("config", &self.inner.config)
      .field("idle", &self.idle())
      .field("stats", &self.stats())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{BufferPool, BufferPoolConfig, BUFFER_SIZE, UDP_BUFFER_SIZE};

  fn small_pool() -> BufferPool {
    BufferPool::new(BufferPoolConfig {
      min_size: 64,
      max_size: 1024,
      max_per_class: 4,
    })
  }

  #[test]
  fn size_classes() {
    let config = BufferPoolConfig {
      min_size: 64,
      max_size: 1024,
      max_per_class: 1,
    };
    assert_eq!(config.num_classes(), 5);
    assert_eq!(config.class_index(1), Some(0));
    assert_eq!(config.class_index(64), Some(0));
    assert_eq!(config.class_index(65), Some(1));
    assert_eq!(config.class_index(1024), Some(4));
    assert_eq!(config.class_index(1025), None);
  }

  #[test]
  fn released_buffer_is_reused_without_stale_window() {
    let pool = small_pool();
    let mut first = pool.allocate(100);
    first.write_slice(&[0xAA; 100]).unwrap();
    first.release();
    assert_eq!(pool.idle(), 1);

    let mut second = pool.allocate(90);
    assert!(second.is_empty());
    assert_eq!(second.capacity(), 90);
    second.write_slice(b"fresh").unwrap();
    assert_eq!(second.bytes(), b"fresh");
    let stats = pool.stats();
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.recycled, 1);
  }

  #[test]
  fn leaked_buffer_never_returns_to_rotation() {
    let pool = small_pool();
    let mut buffer = pool.allocate(128);
    buffer.write_slice(b"held by a writer").unwrap();
    let held = buffer.retain();
    buffer.leak();
    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats().leaked, 1);

    let mut next = pool.allocate(128);
    next.write_slice(&[0u8; 128]).unwrap();
    assert_eq!(&*held, b"held by a writer");
  }

  #[test]
  fn release_of_shared_buffer_degrades_to_leak() {
    let pool = small_pool();
    let mut buffer = pool.allocate(64);
    buffer.write_slice(b"shared").unwrap();
    let held = buffer.retain();
    buffer.release();
    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats().leaked, 1);
    assert_eq!(&*held, b"shared");
  }

  #[test]
  fn default_sizes() {
    let pool = BufferPool::new(BufferPoolConfig::default());
    let stream = pool.allocate_stream();
    let packet = pool.allocate_packet();
    assert_eq!(stream.capacity(), BUFFER_SIZE);
    assert_eq!(packet.capacity(), UDP_BUFFER_SIZE);
    assert!(packet.capacity() > stream.capacity());
    stream.release();
    packet.release();
    assert_eq!(pool.idle(), 2);
  }

  #[test]
  fn oversized_requests_are_unpooled() {
    let pool = small_pool();
    let buffer = pool.allocate(4096);
    assert_eq!(buffer.capacity(), 4096);
    buffer.release();
    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats().unpooled, 1);
  }

  #[test]
  fn concurrent_allocation() {
    let pool = small_pool();
    let threads = (0..8)
      .map(|i| {
        let pool = pool.clone();
        std::thread::spawn(move || {
          for _ in 0..1000 {
            let mut buffer = pool.allocate(200);
            buffer.write_slice(&[i as u8; 200]).unwrap();
            assert!(buffer.bytes().iter().all(|b| *b == i as u8));
            buffer.release();
          }
        })
      })
      .collect::<Vec<_>>();
    for thread in threads {
      thread.join().unwrap();
    }
    assert_eq!(pool.stats().allocated, 8000);
    assert!(pool.idle() <= 4);
  }
}
