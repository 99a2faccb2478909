// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};

use anyhow::{Context as AnyhowContext, Result};
use ferry::common::decorators::CountingReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Parameters used to run a TCP forwarder
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ForwardArgs {
  pub listen: SocketAddr,
  pub target: SocketAddr,
  pub low_memory: bool,
}

fn byte_counter() -> (Arc<AtomicU64>, impl Fn(u64) + Send + Sync + 'static) {
  let total = Arc::new(AtomicU64::new(0));
  let counter = {
    let total = Arc::clone(&total);
    move |n| {
      total.fetch_add(n, Ordering::Relaxed);
    }
  };
  (total, counter)
}

async fn forward_connection(inbound: TcpStream, target: SocketAddr) -> Result<()> {
  let outbound = TcpStream::connect(target)
    .await
    .with_context(|| format!("Connecting to forwarding target {}", target))?;
  let (uploaded, upload_counter) = byte_counter();
  let (downloaded, download_counter) = byte_counter();
  let (inbound_reader, inbound_writer) = inbound.into_split();
  let (outbound_reader, outbound_writer) = outbound.into_split();
  let result = ferry::copy_conn(
    (
      CountingReader::new(inbound_reader, upload_counter),
      inbound_writer,
    ),
    (
      CountingReader::new(outbound_reader, download_counter),
      outbound_writer,
    ),
  )
  .await;
  tracing::info!(
    uploaded = uploaded.load(Ordering::Relaxed),
    downloaded = downloaded.load(Ordering::Relaxed),
    "Connection closed"
  );
  result.context("Relaying connection")
}

pub async fn forward_main(config: ForwardArgs) -> Result<()> {
  ferry::config::set_low_memory(config.low_memory);
  let listener = TcpListener::bind(config.listen)
    .await
    .with_context(|| format!("Binding forwarder to {}", config.listen))?;
  tracing::info!(listen = ?listener.local_addr()?, target = ?config.target, "Forwarding");

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let mut connection_id = 0u64;
  loop {
    let (inbound, peer) = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok(accepted) => accepted,
        Err(e) => {
          tracing::warn!(error = ?e, "Failed to accept connection");
          continue;
        }
      },
    };
    connection_id += 1;
    let target = config.target;
    tokio::task::spawn(
      async move {
        tracing::debug!("Accepted");
        if let Err(e) = forward_connection(inbound, target).await {
          tracing::warn!(error = ?e, "Forwarding failed");
        }
      }
      .instrument(tracing::info_span!("connection", id = connection_id, peer = ?peer)),
    );
  }

  tracing::info!("Shutting down...");
  sigint_handler_task.abort();
  Ok(())
}
