// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! An in-process datagram session fed through a channel.
//!
//! This is the shape a NAT table hands to a relay for each peer: packets are
//! pushed into the session from elsewhere, and the relay drains them. The
//! reader supports read-wait, so queued buffers go to the destination without
//! an extra copy whenever the destination needs no headroom.

use std::{io, net::SocketAddr, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::mpsc;

use super::network::{PacketReadWaiter, PacketReader, PacketWriter, ReadWaitOptions};
use crate::{
  buf::{Buffer, BufferPool, PacketBuffer},
  util::cancellation::CancellationListener,
};

fn timed_out() -> io::Error {
  io::Error::new(io::ErrorKind::TimedOut, "packet session idle timeout")
}

fn session_closed() -> io::Error {
  io::Error::new(io::ErrorKind::BrokenPipe, "packet session closed")
}

/// Creates a connected writer/reader pair with room for `capacity` queued packets
pub fn packet_channel(
  capacity: usize,
  cancellation: CancellationListener,
) -> (ChannelPacketWriter, ChannelPacketReader) {
  let (sender, receiver) = mpsc::channel(capacity);
  (
    ChannelPacketWriter::new(sender),
    ChannelPacketReader::new(receiver, cancellation),
  )
}

pub struct ChannelPacketReader {
  receiver: mpsc::Receiver<PacketBuffer>,
  cancellation: CancellationListener,
  idle_timeout: Option<Duration>,
  options: Option<ReadWaitOptions>,
}

impl ChannelPacketReader {
  pub fn new(
    receiver: mpsc::Receiver<PacketBuffer>,
    cancellation: CancellationListener,
  ) -> Self {
    Self {
      receiver,
      cancellation,
      idle_timeout: None,
      options: None,
    }
  }

  /// Fails a pending wait with [io::ErrorKind::TimedOut] after `timeout` without a packet
  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = Some(timeout);
    self
  }

  fn next_packet(&mut self) -> BoxFuture<'_, io::Result<PacketBuffer>> {
    let Self {
      receiver,
      cancellation,
      idle_timeout,
      ..
    } = self;
    let idle_timeout = *idle_timeout;
    async move {
      let receive = async move {
        let received = match idle_timeout {
          Some(timeout) => tokio::time::timeout(timeout, receiver.recv())
            .await
            .map_err(|_| timed_out())?,
          None => receiver.recv().await,
        };
        received.ok_or_else(session_closed)
      };
      tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(session_closed()),
        packet = receive => packet,
      }
    }
    .boxed()
  }
}

impl PacketReader for ChannelPacketReader {
  fn read_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
  ) -> BoxFuture<'a, io::Result<SocketAddr>> {
    async move {
      let PacketBuffer {
        buffer: packet,
        destination,
      } = self.next_packet().await?;
      let copied = buffer.write_slice(packet.bytes());
      packet.release();
      copied?;
      Ok(destination)
    }
    .boxed()
  }

  fn packet_read_waiter(&mut self) -> Option<&mut dyn PacketReadWaiter> {
    Some(self)
  }
}

impl PacketReadWaiter for ChannelPacketReader {
  fn initialize_read_waiter(&mut self, options: ReadWaitOptions) -> bool {
    self.options = Some(options);
    false
  }

  fn wait_read_packet(&mut self) -> BoxFuture<'_, io::Result<(Buffer, SocketAddr)>> {
    async move {
      let PacketBuffer {
        buffer: packet,
        destination,
      } = self.next_packet().await?;
      match &self.options {
        Some(options) if options.needs_headroom() => {
          let mut buffer = options.new_packet_buffer();
          let copied = buffer.write_slice(packet.bytes());
          packet.release();
          if let Err(e) = copied {
            buffer.release();
            return Err(e.into());
          }
          options.post_return(&mut buffer);
          Ok((buffer, destination))
        }
        _ => Ok((packet, destination)),
      }
    }
    .boxed()
  }
}

/// Pushes copies of written packets into a [ChannelPacketReader]
#[derive(Debug, Clone)]
pub struct ChannelPacketWriter {
  sender: mpsc::Sender<PacketBuffer>,
  pool: BufferPool,
}

impl ChannelPacketWriter {
  pub fn new(sender: mpsc::Sender<PacketBuffer>) -> Self {
    Self {
      sender,
      pool: BufferPool::global().clone(),
    }
  }
}

impl PacketWriter for ChannelPacketWriter {
  fn write_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
    destination: SocketAddr,
  ) -> BoxFuture<'a, io::Result<()>> {
    async move {
      let mut copy = self.pool.allocate(buffer.len());
      copy.write_slice(buffer.bytes())?;
      self
        .sender
        .send(PacketBuffer::new(copy, destination))
        .await
        .map_err(|rejected| {
          rejected.0.buffer.release();
          session_closed()
        })
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::{io, net::SocketAddr, time::Duration};

  use tokio_util::sync::CancellationToken;

  use super::packet_channel;
  use crate::{
    buf::{Buffer, BufferPool},
    common::network::{PacketReadWaiter, PacketReader, PacketWriter, ReadWaitOptions},
  };

  fn addr() -> SocketAddr {
    "127.0.0.1:5353".parse().unwrap()
  }

  #[tokio::test]
  async fn waiter_relays_headroom_layout() {
    let token = CancellationToken::new();
    let (mut writer, mut reader) = packet_channel(4, token.clone().into());
    writer
      .write_packet(&mut Buffer::from_slice(b"datagram"), addr())
      .await
      .unwrap();

    let options = ReadWaitOptions::new(8, 4, None, BufferPool::global().clone());
    assert!(!reader.initialize_read_waiter(options));
    let (buffer, destination) = reader.wait_read_packet().await.unwrap();
    assert_eq!(destination, addr());
    assert_eq!(buffer.bytes(), b"datagram");
    assert!(buffer.start() >= 8);
    assert!(buffer.free_len() >= 4);
  }

  #[tokio::test]
  async fn idle_timeout_and_cancellation() {
    let token = CancellationToken::new();
    let (_writer, reader) = packet_channel(1, token.clone().into());
    let mut reader = reader.with_idle_timeout(Duration::from_millis(20));
    let mut buffer = Buffer::with_size(64);
    let err = reader.read_packet(&mut buffer).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::TimedOut);

    token.cancel();
    let err = reader.wait_read_packet().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
  }
}
