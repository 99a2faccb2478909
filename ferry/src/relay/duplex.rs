// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Full-duplex relaying between two connections.
//!
//! Each direction runs as its own task. A direction which ends cleanly
//! half-closes its destination so the peer sees end-of-input while the other
//! direction keeps flowing; a direction which fails closes both endpoints,
//! which forces the other direction to stop as well.

use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

use tracing_futures::Instrument;

use super::{packet::copy_packet, stream::copy};
use crate::{
  common::{
    conn::{PacketConn, StreamConn},
    decorators::{CountingPacketWriter, CountingWriter},
    error::{Direction, RelayError, Relayed},
    network::{PacketReader, PacketWriter, StreamReader, StreamWriter},
  },
  util::cancellation::{closed_error, CloseHandle},
};

/// Relays two byte-stream connections into each other until both directions finish.
///
/// `upload` carries `a` to `b`, `download` carries `b` to `a`. When both
/// directions fail, the `download` error is the one returned.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn copy_conn<A: StreamConn, B: StreamConn>(a: A, b: B) -> Result<(), RelayError> {
  let (a_reader, a_writer) = a.into_split();
  let (b_reader, b_writer) = b.into_split();
  let (a_close, b_close) = (CloseHandle::new(), CloseHandle::new());

  let upload = tokio::spawn(
    stream_direction(
      Direction::Upload,
      a_reader,
      b_writer,
      a_close.clone(),
      b_close.clone(),
    )
    .instrument(tracing::trace_span!("relay", direction = %Direction::Upload)),
  );
  let download = tokio::spawn(
    stream_direction(
      Direction::Download,
      b_reader,
      a_writer,
      b_close.clone(),
      a_close.clone(),
    )
    .instrument(tracing::trace_span!("relay", direction = %Direction::Download)),
  );
  let (upload, download) = futures::future::join(upload, download).await;
  a_close.close();
  b_close.close();
  settle(
    upload.unwrap_or_else(|e| task_failure(Direction::Upload, e)),
    download.unwrap_or_else(|e| task_failure(Direction::Download, e)),
  )
}

/// Relays two datagram connections into each other until either direction fails.
///
/// Datagram relays have no clean end, so this always resolves to the error
/// which stopped the relay; a finished direction closes both endpoints.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn copy_packet_conn<A: PacketConn, B: PacketConn>(a: A, b: B) -> Result<(), RelayError> {
  let (a_reader, a_writer) = a.into_split();
  let (b_reader, b_writer) = b.into_split();
  let (a_close, b_close) = (CloseHandle::new(), CloseHandle::new());

  let upload = tokio::spawn(
    packet_direction(
      Direction::Upload,
      a_reader,
      b_writer,
      a_close.clone(),
      b_close.clone(),
    )
    .instrument(tracing::trace_span!("relay", direction = %Direction::Upload)),
  );
  let download = tokio::spawn(
    packet_direction(
      Direction::Download,
      b_reader,
      a_writer,
      b_close.clone(),
      a_close.clone(),
    )
    .instrument(tracing::trace_span!("relay", direction = %Direction::Download)),
  );
  let (upload, download) = futures::future::join(upload, download).await;
  a_close.close();
  b_close.close();
  settle(
    upload.unwrap_or_else(|e| task_failure(Direction::Upload, e)),
    download.unwrap_or_else(|e| task_failure(Direction::Download, e)),
  )
}

fn task_failure(direction: Direction, error: tokio::task::JoinError) -> Relayed {
  Relayed::failed(0, RelayError::Task(error.to_string()).with_direction(direction))
}

fn settle(upload: Relayed, download: Relayed) -> Result<(), RelayError> {
  tracing::trace!(
    upload = upload.bytes,
    download = download.bytes,
    "Duplex relay finished"
  );
  match (upload.error, download.error) {
    (_, Some(e)) | (Some(e), None) => Err(e),
    (None, None) => Ok(()),
  }
}

fn delivered_counter() -> (Arc<AtomicU64>, impl Fn(u64) + Send + Sync + 'static) {
  let delivered = Arc::new(AtomicU64::new(0));
  let counter = {
    let delivered = Arc::clone(&delivered);
    move |n| {
      delivered.fetch_add(n, Ordering::Relaxed);
    }
  };
  (delivered, counter)
}

async fn stream_direction<R: StreamReader, W: StreamWriter>(
  direction: Direction,
  mut reader: R,
  writer: W,
  source: CloseHandle,
  destination: CloseHandle,
) -> Relayed {
  let (delivered, counter) = delivered_counter();
  let mut writer = CountingWriter::new(writer, counter);
  let relayed = tokio::select! {
    relayed = copy(&mut writer, &mut reader) => relayed,
    _ = source.closed() => Relayed::failed(delivered.load(Ordering::Relaxed), closed_error()),
    _ = destination.closed() => Relayed::failed(delivered.load(Ordering::Relaxed), closed_error()),
  };
  let mut writer = writer.into_inner();
  let bytes = relayed.bytes;
  if let Some(e) = relayed.error {
    tracing::debug!(error = ?e, bytes, "Relay direction failed");
    source.close();
    destination.close();
    return Relayed::failed(bytes, e.with_direction(direction));
  }
  match writer.as_half_close() {
    Some(half) => {
      if let Err(e) = half.close_write().await {
        tracing::trace!(error = ?e, "Half-close of destination failed");
      }
    }
    None => {
      source.close();
      destination.close();
    }
  }
  tracing::trace!(bytes, "Relay direction finished");
  Relayed::done(bytes)
}

async fn packet_direction<R: PacketReader, W: PacketWriter>(
  direction: Direction,
  mut reader: R,
  writer: W,
  source: CloseHandle,
  destination: CloseHandle,
) -> Relayed {
  let (delivered, counter) = delivered_counter();
  let mut writer = CountingPacketWriter::new(writer, counter);
  let relayed = tokio::select! {
    relayed = copy_packet(&mut writer, &mut reader) => relayed,
    _ = source.closed() => Relayed::failed(delivered.load(Ordering::Relaxed), closed_error()),
    _ = destination.closed() => Relayed::failed(delivered.load(Ordering::Relaxed), closed_error()),
  };
  source.close();
  destination.close();
  let bytes = relayed.bytes;
  match relayed.error {
    Some(e) => {
      tracing::debug!(error = ?e, bytes, "Packet relay direction stopped");
      Relayed::failed(bytes, e.with_direction(direction))
    }
    None => Relayed::done(bytes),
  }
}

#[cfg(test)]
mod tests {
  use std::{io, time::Duration};

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

  use super::copy_conn;
  use crate::common::conn::IoConn;

  // Given input to one side terminating, ensure that a source stream closing also closes its output
  #[tokio::test]
  async fn independent_directional_closure() {
    let (client, near) = duplex(2048);
    let (far, server) = duplex(2048);
    let request = Vec::from(*b"request").repeat(128);
    let response = Vec::from(*b"response").repeat(128);

    let relay = tokio::spawn(copy_conn(IoConn(near), IoConn(far)));

    let server = tokio::spawn({
      let response = response.clone();
      async move {
        let (mut r, mut w) = tokio::io::split(server);
        let mut received = Vec::new();
        r.read_to_end(&mut received).await?;
        w.write_all(&response).await?;
        w.shutdown().await?;
        Ok::<_, io::Error>(received)
      }
    });

    let (mut r, mut w) = tokio::io::split(client);
    w.write_all(&request).await.unwrap();
    w.shutdown().await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), r.read_to_end(&mut received))
      .await
      .expect("Timeout reached running async test")
      .unwrap();

    assert_eq!(received, response);
    assert_eq!(server.await.unwrap().unwrap(), request);
    relay.await.unwrap().unwrap();
  }
}
