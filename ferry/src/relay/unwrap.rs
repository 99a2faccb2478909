// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Peels counting and caching decorators off relay endpoints.
//!
//! Counters are collected outer to inner and cached data in delivery order, so
//! that the transports underneath can be probed for fast paths while the
//! decorators' effects are still applied by the relay.

use std::collections::VecDeque;

use crate::{
  buf::{Buffer, PacketBuffer},
  common::{
    error::RelayError,
    network::{
      CountFunc, PacketReader, PacketReaderLayer, PacketWriter, PacketWriterLayer, ReaderLayer,
      StreamReader, StreamWriter, WriterLayer,
    },
  },
};

/// Layers walked before a chain is assumed to be cyclic
pub const MAX_UNWRAP_DEPTH: usize = 64;

/// Counters gathered from both sides of one relay call
#[derive(Default)]
pub(crate) struct Counters {
  pub(crate) read: Vec<CountFunc>,
  pub(crate) write: Vec<CountFunc>,
}

impl Counters {
  /// Reports one delivered chunk to every read counter, then every write counter
  pub(crate) fn count(&self, n: u64) {
    for counter in self.read.iter().chain(self.write.iter()) {
      counter(n);
    }
  }
}

pub(crate) fn unwrap_writer<'a>(
  mut writer: &'a mut dyn StreamWriter,
  counters: &mut Vec<CountFunc>,
) -> Result<&'a mut dyn StreamWriter, RelayError> {
  for _ in 0..MAX_UNWRAP_DEPTH {
    match writer.upstream() {
      WriterLayer::Counted { counter, inner } => {
        counters.push(counter);
        writer = inner;
      }
      WriterLayer::Base(base) => return Ok(base),
    }
  }
  Err(RelayError::ChainTooDeep(MAX_UNWRAP_DEPTH))
}

pub(crate) fn unwrap_reader<'a>(
  mut reader: &'a mut dyn StreamReader,
  counters: &mut Vec<CountFunc>,
  cached: &mut VecDeque<Buffer>,
) -> Result<&'a mut dyn StreamReader, RelayError> {
  for _ in 0..MAX_UNWRAP_DEPTH {
    match reader.upstream() {
      ReaderLayer::Counted { counter, inner } => {
        counters.push(counter);
        reader = inner;
      }
      ReaderLayer::Cached {
        cached: mut layer_cache,
        inner,
      } => {
        cached.append(&mut layer_cache);
        reader = inner;
      }
      ReaderLayer::Base(base) => return Ok(base),
    }
  }
  Err(RelayError::ChainTooDeep(MAX_UNWRAP_DEPTH))
}

pub(crate) fn unwrap_packet_writer<'a>(
  mut writer: &'a mut dyn PacketWriter,
  counters: &mut Vec<CountFunc>,
) -> Result<&'a mut dyn PacketWriter, RelayError> {
  for _ in 0..MAX_UNWRAP_DEPTH {
    match writer.upstream() {
      PacketWriterLayer::Counted { counter, inner } => {
        counters.push(counter);
        writer = inner;
      }
      PacketWriterLayer::Base(base) => return Ok(base),
    }
  }
  Err(RelayError::ChainTooDeep(MAX_UNWRAP_DEPTH))
}

pub(crate) fn unwrap_packet_reader<'a>(
  mut reader: &'a mut dyn PacketReader,
  counters: &mut Vec<CountFunc>,
  cached: &mut VecDeque<PacketBuffer>,
) -> Result<&'a mut dyn PacketReader, RelayError> {
  for _ in 0..MAX_UNWRAP_DEPTH {
    match reader.upstream() {
      PacketReaderLayer::Counted { counter, inner } => {
        counters.push(counter);
        reader = inner;
      }
      PacketReaderLayer::Cached {
        cached: mut layer_cache,
        inner,
      } => {
        cached.append(&mut layer_cache);
        reader = inner;
      }
      PacketReaderLayer::Base(base) => return Ok(base),
    }
  }
  Err(RelayError::ChainTooDeep(MAX_UNWRAP_DEPTH))
}

#[cfg(test)]
mod tests {
  use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
  };

  use futures::{future::BoxFuture, FutureExt};

  use super::{unwrap_reader, unwrap_writer, Counters, MAX_UNWRAP_DEPTH};
  use crate::{
    buf::Buffer,
    common::{
      conn::{IoReader, IoWriter},
      decorators::{CachedReader, CountingReader, CountingWriter},
      error::RelayError,
      network::{ReaderLayer, StreamReader},
    },
  };

  #[test]
  fn counters_collected_outer_to_inner() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tagged = |tag: &'static str| {
      let log = Arc::clone(&log);
      move |n: u64| log.lock().unwrap().push((tag, n))
    };
    let mut reader = CountingReader::new(
      CachedReader::new(
        CountingReader::new(IoReader::new(tokio::io::empty()), tagged("read-inner")),
        vec![Buffer::from_slice(b"cached")],
      ),
      tagged("read-outer"),
    );
    let mut writer = CountingWriter::new(IoWriter::new(tokio::io::sink()), tagged("write"));

    let mut counters = Counters::default();
    let mut cached = VecDeque::new();
    unwrap_reader(&mut reader, &mut counters.read, &mut cached).unwrap();
    unwrap_writer(&mut writer, &mut counters.write).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].bytes(), b"cached");

    counters.count(3);
    assert_eq!(
      *log.lock().unwrap(),
      vec![("read-outer", 3), ("read-inner", 3), ("write", 3)]
    );
  }

  /// A reader which claims to wrap itself forever
  struct Ouroboros;

  impl StreamReader for Ouroboros {
    fn read_buffer<'a>(&'a mut self, _: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
      futures::future::ready(Ok(0)).boxed()
    }

    fn upstream(&mut self) -> ReaderLayer<'_> {
      ReaderLayer::Counted {
        counter: Arc::new(|_| {}),
        inner: self,
      }
    }
  }

  #[test]
  fn cyclic_chain_is_rejected() {
    let mut counters = Vec::new();
    let mut cached = VecDeque::new();
    let mut reader = Ouroboros;
    let result = unwrap_reader(&mut reader, &mut counters, &mut cached);
    assert!(matches!(result, Err(RelayError::ChainTooDeep(MAX_UNWRAP_DEPTH))));
    assert_eq!(counters.len(), MAX_UNWRAP_DEPTH);
  }
}
