// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Relay endpoints for tokio transports and generic async streams.

use std::{io, net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
  net::{tcp, TcpStream, UdpSocket},
};
#[cfg(unix)]
use tokio::net::{unix, UnixStream};

use super::network::{
  HalfClose, PacketReader, PacketWriter, RawConn, StreamReader, StreamWriter,
};
use crate::buf::Buffer;

/// A duplex byte-stream endpoint which can be split into independently owned halves
pub trait StreamConn: Send + 'static {
  type Reader: StreamReader + 'static;
  type Writer: StreamWriter + 'static;

  fn into_split(self) -> (Self::Reader, Self::Writer);
}

/// A duplex datagram endpoint which can be split into independently owned halves
pub trait PacketConn: Send + 'static {
  type Reader: PacketReader + 'static;
  type Writer: PacketWriter + 'static;

  fn into_split(self) -> (Self::Reader, Self::Writer);
}

impl<R, W> StreamConn for (R, W)
where
  R: StreamReader + 'static,
  W: StreamWriter + 'static,
{
  type Reader = R;
  type Writer = W;

  fn into_split(self) -> (R, W) {
    self
  }
}

impl<R, W> PacketConn for (R, W)
where
  R: PacketReader + 'static,
  W: PacketWriter + 'static,
{
  type Reader = R;
  type Writer = W;

  fn into_split(self) -> (R, W) {
    self
  }
}

fn read_into<'a, R: AsyncRead + Unpin + Send + ?Sized>(
  reader: &'a mut R,
  buffer: &'a mut Buffer,
) -> BoxFuture<'a, io::Result<usize>> {
  async move {
    let n = reader.read(buffer.free_bytes_mut()).await?;
    buffer.commit(n);
    Ok(n)
  }
  .boxed()
}

fn write_from<'a, W: AsyncWrite + Unpin + Send + ?Sized>(
  writer: &'a mut W,
  buffer: &'a mut Buffer,
) -> BoxFuture<'a, io::Result<()>> {
  async move { writer.write_all(buffer.bytes()).await }.boxed()
}

/// Adapts any [AsyncRead] into a [StreamReader]
#[derive(Debug)]
pub struct IoReader<R> {
  inner: R,
}

impl<R: AsyncRead + Unpin + Send> IoReader<R> {
  pub fn new(inner: R) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> R {
    self.inner
  }
}

impl<R: AsyncRead + Unpin + Send> StreamReader for IoReader<R> {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    read_into(&mut self.inner, buffer)
  }
}

/// Adapts any [AsyncWrite] into a [StreamWriter]; half-closing shuts the writer down
#[derive(Debug)]
pub struct IoWriter<W> {
  inner: W,
}

impl<W: AsyncWrite + Unpin + Send> IoWriter<W> {
  pub fn new(inner: W) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter for IoWriter<W> {
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    write_from(&mut self.inner, buffer)
  }

  fn as_half_close(&mut self) -> Option<&mut dyn HalfClose> {
    Some(self)
  }
}

impl<W: AsyncWrite + Unpin + Send> HalfClose for IoWriter<W> {
  fn close_write(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.inner.shutdown().boxed()
  }
}

/// Any async duplex stream, split through [tokio::io::split]
#[derive(Debug)]
pub struct IoConn<T>(pub T);

impl<T> StreamConn for IoConn<T>
where
  T: AsyncRead + AsyncWrite + Send + 'static,
{
  type Reader = IoReader<ReadHalf<T>>;
  type Writer = IoWriter<WriteHalf<T>>;

  fn into_split(self) -> (Self::Reader, Self::Writer) {
    let (r, w) = tokio::io::split(self.0);
    (IoReader::new(r), IoWriter::new(w))
  }
}

impl StreamReader for tcp::OwnedReadHalf {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    read_into(self, buffer)
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    Some(RawConn::Tcp(self.as_ref()))
  }
}

impl StreamWriter for tcp::OwnedWriteHalf {
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    write_from(self, buffer)
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    Some(RawConn::Tcp(self.as_ref()))
  }

  fn as_half_close(&mut self) -> Option<&mut dyn HalfClose> {
    Some(self)
  }
}

impl HalfClose for tcp::OwnedWriteHalf {
  fn close_write(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.shutdown().boxed()
  }
}

impl StreamConn for TcpStream {
  type Reader = tcp::OwnedReadHalf;
  type Writer = tcp::OwnedWriteHalf;

  fn into_split(self) -> (Self::Reader, Self::Writer) {
    TcpStream::into_split(self)
  }
}

#[cfg(unix)]
impl StreamReader for unix::OwnedReadHalf {
  fn read_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<usize>> {
    read_into(self, buffer)
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    Some(RawConn::Unix(self.as_ref()))
  }
}

#[cfg(unix)]
impl StreamWriter for unix::OwnedWriteHalf {
  fn write_buffer<'a>(&'a mut self, buffer: &'a mut Buffer) -> BoxFuture<'a, io::Result<()>> {
    write_from(self, buffer)
  }

  fn raw_conn(&self) -> Option<RawConn<'_>> {
    Some(RawConn::Unix(self.as_ref()))
  }

  fn as_half_close(&mut self) -> Option<&mut dyn HalfClose> {
    Some(self)
  }
}

#[cfg(unix)]
impl HalfClose for unix::OwnedWriteHalf {
  fn close_write(&mut self) -> BoxFuture<'_, io::Result<()>> {
    self.shutdown().boxed()
  }
}

#[cfg(unix)]
impl StreamConn for UnixStream {
  type Reader = unix::OwnedReadHalf;
  type Writer = unix::OwnedWriteHalf;

  fn into_split(self) -> (Self::Reader, Self::Writer) {
    UnixStream::into_split(self)
  }
}

/// Receiving half of a shared [UdpSocket]
#[derive(Debug, Clone)]
pub struct UdpPacketReader {
  socket: Arc<UdpSocket>,
}

/// Sending half of a shared [UdpSocket]
#[derive(Debug, Clone)]
pub struct UdpPacketWriter {
  socket: Arc<UdpSocket>,
}

impl PacketReader for UdpPacketReader {
  fn read_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
  ) -> BoxFuture<'a, io::Result<SocketAddr>> {
    async move {
      let (n, from) = self.socket.recv_from(buffer.free_bytes_mut()).await?;
      buffer.commit(n);
      Ok(from)
    }
    .boxed()
  }
}

impl PacketWriter for UdpPacketWriter {
  fn write_packet<'a>(
    &'a mut self,
    buffer: &'a mut Buffer,
    destination: SocketAddr,
  ) -> BoxFuture<'a, io::Result<()>> {
    async move {
      let sent = self.socket.send_to(buffer.bytes(), destination).await?;
      if sent < buffer.len() {
        return Err(io::Error::new(
          io::ErrorKind::WriteZero,
          "datagram truncated on send",
        ));
      }
      Ok(())
    }
    .boxed()
  }
}

impl PacketConn for UdpSocket {
  type Reader = UdpPacketReader;
  type Writer = UdpPacketWriter;

  fn into_split(self) -> (Self::Reader, Self::Writer) {
    Arc::new(self).into_split()
  }
}

impl PacketConn for Arc<UdpSocket> {
  type Reader = UdpPacketReader;
  type Writer = UdpPacketWriter;

  fn into_split(self) -> (Self::Reader, Self::Writer) {
    (
      UdpPacketReader {
        socket: Arc::clone(&self),
      },
      UdpPacketWriter { socket: self },
    )
  }
}
