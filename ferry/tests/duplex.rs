// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  io,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use ferry::{
  buf::Buffer,
  common::{
    channel::packet_channel,
    conn::{IoReader, IoWriter},
    decorators::{CachedReader, CountingReader, CountingWriter},
    network::{PacketReader, PacketWriter, StreamReader, StreamWriter},
  },
  relay::{copy, copy_conn, copy_packet_conn},
  Direction,
};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncReadExt, AsyncWriteExt},
  net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

async fn tcp_pair() -> io::Result<(TcpStream, TcpStream)> {
  let listener = TcpListener::bind("127.0.0.1:0").await?;
  let address = listener.local_addr()?;
  let (connected, accepted) = tokio::join!(TcpStream::connect(address), listener.accept());
  Ok((connected?, accepted?.0))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_pong_through_tcp_relay() {
  init_logging();
  let (client, relay_inbound) = tcp_pair().await.unwrap();
  let (relay_outbound, server) = tcp_pair().await.unwrap();

  let relay = tokio::spawn(copy_conn(relay_inbound, relay_outbound));
  let server = tokio::spawn(async move {
    let (mut r, mut w) = server.into_split();
    let mut ping = [0u8; 4];
    r.read_exact(&mut ping).await?;
    assert_eq!(&ping, b"ping");
    w.write_all(b"pong").await?;
    let mut rest = Vec::new();
    r.read_to_end(&mut rest).await?;
    w.shutdown().await?;
    Ok::<_, io::Error>(rest)
  });

  let (mut r, mut w) = client.into_split();
  w.write_all(b"ping").await.unwrap();
  let mut pong = [0u8; 4];
  tokio::time::timeout(Duration::from_secs(10), r.read_exact(&mut pong))
    .await
    .expect("Timeout reached running async test")
    .unwrap();
  assert_eq!(&pong, b"pong");
  w.shutdown().await.unwrap();

  let mut rest = Vec::new();
  r.read_to_end(&mut rest).await.unwrap();
  assert!(rest.is_empty());
  assert!(server.await.unwrap().unwrap().is_empty());
  tokio::time::timeout(Duration::from_secs(10), relay)
    .await
    .expect("Timeout reached running async test")
    .unwrap()
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_to_tcp_relay_counts_every_byte() {
  init_logging();
  let (mut sender, relay_inbound) = tcp_pair().await.unwrap();
  let (relay_outbound, mut receiver) = tcp_pair().await.unwrap();
  let data: Vec<u8> = (0..2 * 1024 * 1024).map(|i: usize| (i % 253) as u8).collect();

  let (read_count, write_count) = (Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0)));
  let counter = |total: &Arc<AtomicU64>| {
    let total = Arc::clone(total);
    move |n| {
      total.fetch_add(n, Ordering::Relaxed);
    }
  };
  let (inbound, _inbound_writer) = relay_inbound.into_split();
  let (_outbound_reader, outbound) = relay_outbound.into_split();
  let mut source = CountingReader::new(inbound, counter(&read_count));
  let mut destination = CountingWriter::new(outbound, counter(&write_count));
  let relay = tokio::spawn(async move { copy(&mut destination, &mut source).await });

  let sending = tokio::spawn({
    let data = data.clone();
    async move {
      sender.write_all(&data).await?;
      sender.shutdown().await
    }
  });
  let relayed = tokio::time::timeout(Duration::from_secs(30), relay)
    .await
    .expect("Timeout reached running async test")
    .unwrap();
  sending.await.unwrap().unwrap();
  assert_eq!(relayed.into_result().unwrap(), data.len() as u64);
  assert_eq!(read_count.load(Ordering::Relaxed), data.len() as u64);
  assert_eq!(write_count.load(Ordering::Relaxed), data.len() as u64);

  // the relay's halves are gone, so the receiver sees end of input
  let mut received = Vec::new();
  receiver.read_to_end(&mut received).await.unwrap();
  assert_eq!(received, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_delivery_rules_out_handshake_failure() {
  init_logging();
  let (mut sender, relay_inbound) = tcp_pair().await.unwrap();
  let (relay_outbound, receiver) = tcp_pair().await.unwrap();
  // the cached chunk still goes out; the peer answers it with a reset
  drop(receiver);

  let (inbound, _inbound_writer) = relay_inbound.into_split();
  let (_outbound_reader, mut destination) = relay_outbound.into_split();
  let mut source = CachedReader::new(inbound, vec![Buffer::from_slice(b"head")]);
  let relay = tokio::spawn(async move { copy(&mut destination, &mut source).await });
  let sending = tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    let chunk = vec![7u8; 64 * 1024];
    while sender.write_all(&chunk).await.is_ok() {}
  });

  let relayed = tokio::time::timeout(Duration::from_secs(10), relay)
    .await
    .expect("Timeout reached running async test")
    .unwrap();
  sending.abort();
  assert!(relayed.bytes >= 4);
  let error = relayed.error.expect("destination peer is gone");
  assert!(!error.is_handshake_failure(), "{}", error);
  assert!(error.io_kind().is_some());
}

/// Refuses every write
struct Refusing;

impl StreamWriter for Refusing {
  fn write_buffer<'a>(&'a mut self, _: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    futures::future::ready(Err(io::ErrorKind::ConnectionReset.into())).boxed()
  }
}

/// Produces its payload only after a delay
struct Delayed {
  delay: Duration,
  payload: Option<Vec<u8>>,
}

impl StreamReader for Delayed {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    async move {
      tokio::time::sleep(self.delay).await;
      match self.payload.take() {
        Some(payload) => {
          buffer.write_slice(&payload)?;
          Ok(payload.len())
        }
        None => Ok(0),
      }
    }
    .boxed()
  }
}

fn payload(data: &[u8]) -> IoReader<io::Cursor<Vec<u8>>> {
  IoReader::new(io::Cursor::new(data.to_vec()))
}

#[tokio::test]
async fn failed_direction_is_labelled() {
  init_logging();
  let a = (
    Delayed {
      delay: Duration::from_millis(50),
      payload: Some(b"upload".to_vec()),
    },
    IoWriter::new(Vec::<u8>::new()),
  );
  let b = (payload(b""), Refusing);
  let error = copy_conn(a, b).await.unwrap_err();
  assert_eq!(error.direction(), Some(Direction::Upload));
  assert!(error.is_handshake_failure());
  assert!(error.to_string().starts_with("upload: "));
}

#[tokio::test]
async fn download_error_wins_when_both_fail() {
  let a = (payload(b"to b"), Refusing);
  let b = (payload(b"to a"), Refusing);
  let error = copy_conn(a, b).await.unwrap_err();
  assert_eq!(error.direction(), Some(Direction::Download));
}

#[tokio::test]
async fn packet_duplex_runs_until_a_source_stops() {
  init_logging();
  let peer = "192.0.2.7:4000".parse().unwrap();
  let shutdown = CancellationToken::new();
  let (mut into_a, a_reader) = packet_channel(8, shutdown.clone().into());
  let (mut into_b, b_reader) = packet_channel(8, shutdown.clone().into());
  let (a_writer, mut out_of_a) = packet_channel(8, Default::default());
  let (b_writer, mut out_of_b) = packet_channel(8, Default::default());
  let relay = tokio::spawn(copy_packet_conn((a_reader, a_writer), (b_reader, b_writer)));

  into_a
    .write_packet(&mut Buffer::from_slice(b"upload"), peer)
    .await
    .unwrap();
  into_b
    .write_packet(&mut Buffer::from_slice(b"download"), peer)
    .await
    .unwrap();

  let mut buffer = Buffer::with_size(64);
  assert_eq!(out_of_b.read_packet(&mut buffer).await.unwrap(), peer);
  assert_eq!(buffer.bytes(), b"upload");
  buffer.reset();
  assert_eq!(out_of_a.read_packet(&mut buffer).await.unwrap(), peer);
  assert_eq!(buffer.bytes(), b"download");

  shutdown.cancel();
  let error = tokio::time::timeout(Duration::from_secs(10), relay)
    .await
    .expect("Timeout reached running async test")
    .unwrap()
    .unwrap_err();
  assert!(error.direction().is_some());
  assert!(matches!(
    error.io_kind(),
    Some(io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted)
  ));
}
