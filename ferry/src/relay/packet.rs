// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Single-direction datagram relay.
//!
//! Datagram sources have no end-of-input; a packet relay runs until either
//! side fails, which includes idle timeouts and cancellation raised by the
//! source.

use std::collections::VecDeque;

use super::{
  unwrap::{unwrap_packet_reader, unwrap_packet_writer, Counters},
  wait::{copy_packet_wait, WaitOutcome},
  write_failure,
};
use crate::{
  buf::{BufferPool, PacketBuffer},
  common::{
    error::Relayed,
    network::{calculate_mtu, PacketReader, PacketWriter, ReadWaitOptions},
  },
  config,
};

/// Relays datagrams from `source` to `destination`, using the process-wide pool
pub async fn copy_packet(
  destination: &mut dyn PacketWriter,
  source: &mut dyn PacketReader,
) -> Relayed {
  copy_packet_with_pool(BufferPool::global(), destination, source).await
}

/// Relays datagrams from `source` to `destination` until either side fails.
///
/// Each packet is written to the address its source reported for it.
pub async fn copy_packet_with_pool(
  pool: &BufferPool,
  destination: &mut dyn PacketWriter,
  source: &mut dyn PacketReader,
) -> Relayed {
  let mut counters = Counters::default();
  let mut cached = VecDeque::new();
  let destination = match unwrap_packet_writer(destination, &mut counters.write) {
    Ok(destination) => destination,
    Err(e) => return Relayed::failed(0, e),
  };
  let source = match unwrap_packet_reader(source, &mut counters.read, &mut cached) {
    Ok(source) => source,
    Err(e) => return Relayed::failed(0, e),
  };

  let options = ReadWaitOptions::new(
    destination.front_headroom(),
    destination.rear_headroom(),
    calculate_mtu(source.read_mtu(), destination.write_mtu()),
    pool.clone(),
  );

  let drained = drain_cached(destination, cached, &options).await;
  if !drained.is_ok() {
    return drained;
  }
  let mut total = drained.bytes;
  let mut delivered_any = total > 0;

  if let Some(waiter) = source.packet_read_waiter() {
    let needs_copy = waiter.initialize_read_waiter(options.clone());
    if !needs_copy || config::low_memory() {
      match copy_packet_wait(destination, waiter, &counters, delivered_any).await {
        WaitOutcome::Handled(relayed) => return relayed.after(total),
        WaitOutcome::NotHandled { bytes } => {
          tracing::trace!(bytes, "Packet read-wait declined; continuing with pooled copies");
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

/// Re-lays cached datagrams into destination-shaped buffers and writes them in order.
///
/// A cached datagram too large for the negotiated layout is dropped.
async fn drain_cached(
  destination: &mut dyn PacketWriter,
  cached: VecDeque<PacketBuffer>,
  options: &ReadWaitOptions,
) -> Relayed {
  let mut total = 0u64;
  let mut packets = cached.into_iter();
  while let Some(packet) = packets.next() {
    let mut buffer = options.new_packet_buffer();
    let copied = buffer.write_slice(packet.buffer.bytes());
    packet.buffer.release();
    if let Err(e) = copied {
      tracing::debug!(error = %e, "Dropping cached datagram");
      buffer.release();
      continue;
    }
    let n = buffer.len() as u64;
    options.post_return(&mut buffer);
    if let Err(e) = destination.write_packet(&mut buffer, packet.destination).await {
      buffer.leak();
      packets.for_each(|rest| rest.buffer.release());
      return Relayed::failed(total, write_failure(e, total > 0));
    }
    buffer.release();
    total += n;
  }
  Relayed::done(total)
}

async fn copy_pooled(
  destination: &mut dyn PacketWriter,
  source: &mut dyn PacketReader,
  options: &ReadWaitOptions,
  counters: &Counters,
  mut delivered_any: bool,
) -> Relayed {
  let mut total = 0u64;
  loop {
    let mut buffer = options.new_packet_buffer();
    let target = match source.read_packet(&mut buffer).await {
      Ok(target) => target,
      Err(e) => {
        buffer.release();
        return Relayed::failed(total, e);
      }
    };
    let n = buffer.len() as u64;
    options.post_return(&mut buffer);
    if let Err(e) = destination.write_packet(&mut buffer, target).await {
      buffer.leak();
      return Relayed::failed(total, write_failure(e, delivered_any));
    }
    buffer.release();
    total += n;
    counters.count(n);
    delivered_any = true;
  }
}
