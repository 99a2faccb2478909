// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Single-direction byte-stream relay.

use std::{collections::VecDeque, io};

use super::{
  splice,
  unwrap::{unwrap_reader, unwrap_writer, Counters},
  wait::{copy_wait, WaitOutcome},
  write_failure,
};
use crate::{
  buf::{Buffer, BufferPool},
  common::{
    error::Relayed,
    network::{calculate_mtu, ReadWaitOptions, StreamReader, StreamWriter},
  },
  config,
};

/// Relays `source` into `destination` until end of input, using the process-wide pool
pub async fn copy(destination: &mut dyn StreamWriter, source: &mut dyn StreamReader) -> Relayed {
  copy_with_pool(BufferPool::global(), destination, source).await
}

/// Relays `source` into `destination` until end of input.
///
/// Counting decorators on either side are honored without their per-call
/// overhead, and data cached by decorators on `source` is delivered first.
/// Reaching the end of `source` is a success; the destination is left open.
pub async fn copy_with_pool(
  pool: &BufferPool,
  destination: &mut dyn StreamWriter,
  source: &mut dyn StreamReader,
) -> Relayed {
  let mut counters = Counters::default();
  let mut cached = VecDeque::new();
  let destination = match unwrap_writer(destination, &mut counters.write) {
    Ok(destination) => destination,
    Err(e) => return Relayed::failed(0, e),
  };
  let source = match unwrap_reader(source, &mut counters.read, &mut cached) {
    Ok(source) => source,
    Err(e) => return Relayed::failed(0, e),
  };

  let drained = drain_cached(destination, cached).await;
  if !drained.is_ok() {
    return drained;
  }
  let mut total = drained.bytes;
  let mut delivered_any = total > 0;

  source.set_deadline(None);
  destination.set_deadline(None);

  {
    let raw = (source.raw_conn(), destination.raw_conn());
    if let (Some(from), Some(to)) = raw {
      if let Some(relayed) = splice::copy_direct(from, to, &counters, delivered_any).await {
        tracing::trace!(bytes = relayed.bytes, "Spliced stream relay finished");
        return relayed.after(total);
      }
    }
  }

  let options = ReadWaitOptions::new(
    destination.front_headroom(),
    destination.rear_headroom(),
    calculate_mtu(source.read_mtu(), destination.write_mtu()),
    pool.clone(),
  );
  if let Some(waiter) = source.read_waiter() {
    let needs_copy = waiter.initialize_read_waiter(options.clone());
    if !needs_copy || config::low_memory() {
      match copy_wait(destination, waiter, &counters, delivered_any).await {
        WaitOutcome::Handled(relayed) => return relayed.after(total),
        WaitOutcome::NotHandled { bytes } => {
          tracing::trace!(bytes, "Read-wait declined; continuing with pooled copies");
          total += bytes;
          delivered_any |= bytes > 0;
        }
      }
    }
  }

  copy_pooled(destination, source, &options, &counters, delivered_any)
    .await
    .after(total)
}

/// Writes chunks a decorator read ahead, in order, before any fresh reads
async fn drain_cached(destination: &mut dyn StreamWriter, cached: VecDeque<Buffer>) -> Relayed {
  let mut total = 0u64;
  let mut chunks = cached.into_iter();
  while let Some(mut chunk) = chunks.next() {
    if chunk.is_empty() {
      chunk.release();
      continue;
    }
    let n = chunk.len() as u64;
    if let Err(e) = destination.write_buffer(&mut chunk).await {
      chunk.leak();
      chunks.for_each(Buffer::release);
      return Relayed::failed(total, write_failure(e, total > 0));
    }
    chunk.release();
    total += n;
  }
  Relayed::done(total)
}

async fn copy_pooled(
  destination: &mut dyn StreamWriter,
  source: &mut dyn StreamReader,
  options: &ReadWaitOptions,
  counters: &Counters,
  mut delivered_any: bool,
) -> Relayed {
  let mut total = 0u64;
  loop {
    let mut buffer = options.new_buffer();
    match source.read_buffer(&mut buffer).await {
      Ok(0) => {
        buffer.release();
        return Relayed::done(total);
      }
      Ok(_) => {}
      Err(e) => {
        buffer.release();
        return Relayed::failed(total, e);
      }
    }
    let n = buffer.len() as u64;
    options.post_return(&mut buffer);
    if let Err(e) = destination.write_buffer(&mut buffer).await {
      // the destination may still reference the memory
      buffer.leak();
      return Relayed::failed(total, write_failure(e, delivered_any));
    }
    buffer.release();
    total += n;
    counters.count(n);
    delivered_any = true;
  }
}

/// Relays `source` into `destination` through a single caller-owned buffer.
///
/// Decorators are honored as in [copy_with_pool], but splicing and read-wait
/// are skipped. The buffer is laid out for the destination's headroom on every
/// iteration and stays owned by the caller afterwards.
pub async fn copy_with_buffer(
  destination: &mut dyn StreamWriter,
  source: &mut dyn StreamReader,
  buffer: &mut Buffer,
) -> Relayed {
  let mut counters = Counters::default();
  let mut cached = VecDeque::new();
  let destination = match unwrap_writer(destination, &mut counters.write) {
    Ok(destination) => destination,
    Err(e) => return Relayed::failed(0, e),
  };
  let source = match unwrap_reader(source, &mut counters.read, &mut cached) {
    Ok(source) => source,
    Err(e) => return Relayed::failed(0, e),
  };
  let drained = drain_cached(destination, cached).await;
  if !drained.is_ok() {
    return drained;
  }
  let mut total = drained.bytes;
  let mut delivered_any = total > 0;

  let front = destination.front_headroom();
  let rear = destination.rear_headroom();
  buffer.reset();
  if buffer.capacity() <= front + rear {
    return Relayed::failed(
      total,
      io::Error::new(
        io::ErrorKind::InvalidInput,
        "relay buffer leaves no room between headroom reservations",
      ),
    );
  }
  loop {
    buffer.reset();
    buffer.resize(front, 0);
    buffer.reserve(rear);
    match source.read_buffer(buffer).await {
      Ok(0) => return Relayed::done(total),
      Ok(_) => {}
      Err(e) => return Relayed::failed(total, e),
    }
    let n = buffer.len() as u64;
    buffer.over_cap(rear);
    if let Err(e) = destination.write_buffer(buffer).await {
      return Relayed::failed(total, write_failure(e, delivered_any));
    }
    total += n;
    counters.count(n);
    delivered_any = true;
  }
}
