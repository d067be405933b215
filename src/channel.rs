//! Asynchronous duplex endpoints with a completion-based read/write contract
//!
//! A [`Channel`] wraps any byte stream (plain TCP, TLS, in-memory pipes) and a
//! [`DatagramChannel`] wraps a bound UDP socket. Every I/O request runs on the
//! runtime's worker pool and resolves through a [`Completion`] exactly once,
//! handing the caller's buffer back even when the request was cancelled.
//!
//! At most one read and one write may be outstanding per channel. A second
//! request in the same direction fails synchronously, which lets upper layers
//! keep one fixed buffer per direction without further synchronization.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{Error, Result};

/// Transport a [`Channel`] can carry
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Outcome of a stream read or write: the byte count and the caller's buffer
pub type IoCompletion = (Result<usize>, BytesMut);

/// Value a [`Completion`] resolves to when its worker task never finished
pub trait Abandon {
    fn abandoned(err: Error) -> Self;
}

impl Abandon for IoCompletion {
    fn abandoned(err: Error) -> Self {
        (Err(err), BytesMut::new())
    }
}

impl<T> Abandon for Result<T> {
    fn abandoned(err: Error) -> Self {
        Err(err)
    }
}

/// Pending result of an operation issued on a channel
///
/// Dropping a completion does not cancel the operation; closing the channel does.
#[must_use = "completions resolve to the buffer that was lent to the operation"]
pub struct Completion<T> {
    handle: JoinHandle<T>,
}

impl<T> Completion<T> {
    fn spawn<F>(op: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        Self {
            handle: tokio::spawn(op),
        }
    }
}

impl<T: Abandon> Future for Completion<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(output),
            Poll::Ready(Err(err)) => Poll::Ready(T::abandoned(join_error(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn join_error(err: JoinError) -> Error {
    if err.is_cancelled() {
        Error::Cancelled
    } else {
        Error::internal(format!("I/O worker panicked: {}", err))
    }
}

/// Marks one direction of a channel busy until dropped
struct OpGuard(Arc<AtomicBool>);

impl OpGuard {
    fn acquire(flag: &Arc<AtomicBool>, op: &'static str) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(Error::OperationPending(op));
        }
        Ok(Self(flag.clone()))
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ChannelInner {
    peer: Option<SocketAddr>,
    reader: Mutex<Option<ReadHalf<BoxStream>>>,
    writer: Mutex<Option<WriteHalf<BoxStream>>>,
    reading: Arc<AtomicBool>,
    writing: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ChannelInner {
    /// Drops both stream halves if no operation holds them
    fn try_release(&self) -> bool {
        let reader = self.reader.try_lock().map(|mut r| drop(r.take())).is_ok();
        let writer = self.writer.try_lock().map(|mut w| drop(w.take())).is_ok();
        reader && writer
    }
}

/// Shared handle to an asynchronous byte-stream endpoint
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub fn new<S: AsyncStream>(stream: S, peer: Option<SocketAddr>) -> Self {
        Self::from_boxed(Box::new(stream), peer)
    }

    pub fn from_boxed(stream: BoxStream, peer: Option<SocketAddr>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(ChannelInner {
                peer,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                reading: Arc::new(AtomicBool::new(false)),
                writing: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed: {}", e);
        }
        Self::new(stream, peer)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Read up to `buf.capacity()` bytes into `buf`
    ///
    /// Fails immediately if a read is already outstanding or the channel is
    /// closed. Otherwise the returned completion yields the number of bytes
    /// read (zero at end of stream) together with the buffer.
    pub fn read_async(&self, mut buf: BytesMut) -> Result<Completion<IoCompletion>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let guard = OpGuard::acquire(&self.inner.reading, "read")?;
        let inner = self.inner.clone();

        Ok(Completion::spawn(async move {
            buf.clear();
            let result = {
                let mut reader = inner.reader.lock().await;
                let result = match reader.as_mut() {
                    Some(stream) => tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => Err(Error::Cancelled),
                        res = stream.read_buf(&mut buf) => res.map_err(Error::from),
                    },
                    None => Err(Error::Cancelled),
                };
                if inner.cancel.is_cancelled() {
                    reader.take();
                }
                result
            };
            drop(guard);
            (result, buf)
        }))
    }

    /// Write all of `buf` to the channel
    pub fn write_async(&self, buf: BytesMut) -> Result<Completion<IoCompletion>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let guard = OpGuard::acquire(&self.inner.writing, "write")?;
        let inner = self.inner.clone();

        Ok(Completion::spawn(async move {
            let result = {
                let mut writer = inner.writer.lock().await;
                let result = match writer.as_mut() {
                    Some(stream) => tokio::select! {
                        biased;
                        _ = inner.cancel.cancelled() => Err(Error::Cancelled),
                        res = async {
                            stream.write_all(&buf).await?;
                            stream.flush().await
                        } => res.map(|_| buf.len()).map_err(Error::from),
                    },
                    None => Err(Error::Cancelled),
                };
                if inner.cancel.is_cancelled() {
                    writer.take();
                }
                result
            };
            drop(guard);
            (result, buf)
        }))
    }

    /// Convenience wrapper issuing a write of `data` and awaiting it
    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let (result, _) = self.write_async(BytesMut::from(data))?.await;
        result.map(|_| ())
    }

    /// Shut down the write direction, signalling end of stream to the peer
    pub async fn shutdown_write(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let _guard = OpGuard::acquire(&self.inner.writing, "write")?;
        let mut writer = self.inner.writer.lock().await;
        match writer.as_mut() {
            Some(stream) => tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
                res = stream.shutdown() => res.map_err(Error::from),
            },
            None => Err(Error::ChannelClosed),
        }
    }

    /// Close the channel, cancelling outstanding operations
    ///
    /// Idempotent. Outstanding operations complete with [`Error::Cancelled`];
    /// the transport is dropped as soon as no operation holds it.
    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        if !self.inner.try_release() {
            // An operation is unwinding; release once it lets go
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    inner.reader.lock().await.take();
                    inner.writer.lock().await.take();
                });
            }
        }
    }

    /// Detach the transport from an idle channel so it can be re-wrapped
    ///
    /// The channel is closed afterwards; other handles observe it as closed.
    pub fn into_stream(self) -> Result<BoxStream> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let (reader, writer) = {
            let mut reader = self
                .inner
                .reader
                .try_lock()
                .map_err(|_| Error::OperationPending("read"))?;
            let mut writer = self
                .inner
                .writer
                .try_lock()
                .map_err(|_| Error::OperationPending("write"))?;
            (reader.take(), writer.take())
        };
        self.inner.cancel.cancel();

        match (reader, writer) {
            (Some(reader), Some(writer)) => Ok(reader.unsplit(writer)),
            _ => Err(Error::ChannelClosed),
        }
    }
}

struct DatagramInner {
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    receiving: Arc<AtomicBool>,
    cancel: CancellationToken,
}

/// Shared handle to a bound UDP socket
#[derive(Clone)]
pub struct DatagramChannel {
    inner: Arc<DatagramInner>,
}

impl fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("local_addr", &self.inner.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DatagramChannel {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket)
    }

    pub fn from_socket(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            inner: Arc::new(DatagramInner {
                socket: StdMutex::new(Some(Arc::new(socket))),
                local_addr,
                receiving: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        let guard = self
            .inner
            .socket
            .lock()
            .map_err(|_| Error::internal("datagram socket lock poisoned"))?;
        guard.as_ref().cloned().ok_or(Error::ChannelClosed)
    }

    /// Receive one datagram of at most `buf.capacity()` bytes
    pub fn receive_async(&self, mut buf: BytesMut) -> Result<Completion<Result<Datagram>>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let socket = self.socket()?;
        let guard = OpGuard::acquire(&self.inner.receiving, "receive")?;
        let channel = self.clone();

        Ok(Completion::spawn(async move {
            let capacity = buf.capacity().max(1);
            buf.clear();
            buf.resize(capacity, 0);
            let result = tokio::select! {
                biased;
                _ = channel.inner.cancel.cancelled() => Err(Error::Cancelled),
                res = socket.recv_from(&mut buf[..]) => res.map_err(Error::from),
            };
            drop(socket);
            drop(guard);
            result.map(|(len, source)| {
                buf.truncate(len);
                Datagram::new(buf.freeze(), source, channel)
            })
        }))
    }

    /// Send one datagram; datagram sends are atomic and may be issued concurrently
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let socket = self.socket()?;
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
            res = socket.send_to(payload, target) => res.map_err(Error::from),
        }
    }

    pub fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        if let Ok(mut socket) = self.inner.socket.lock() {
            socket.take();
        }
    }
}

/// One received UDP payload together with where it came from
#[derive(Debug, Clone)]
pub struct Datagram {
    payload: Bytes,
    source: SocketAddr,
    channel: DatagramChannel,
}

impl Datagram {
    pub fn new(payload: Bytes, source: SocketAddr, channel: DatagramChannel) -> Self {
        Self {
            payload,
            source,
            channel,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// The channel this datagram arrived on
    pub fn channel(&self) -> &DatagramChannel {
        &self.channel
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let (a, b) = duplex(1024);
        let left = Channel::new(a, None);
        let right = Channel::new(b, None);

        let (written, _) = left.write_async(BytesMut::from(&b"hello"[..])).unwrap().await;
        assert_eq!(written.unwrap(), 5);

        let (read, buf) = right.read_async(BytesMut::with_capacity(64)).unwrap().await;
        assert_eq!(read.unwrap(), 5);
        assert_eq!(&buf[..], b"hello");
    }

    #[tokio::test]
    async fn test_second_read_is_rejected() {
        let (a, _b) = duplex(64);
        let channel = Channel::new(a, None);

        let pending = channel.read_async(BytesMut::with_capacity(16)).unwrap();
        let second = channel.read_async(BytesMut::with_capacity(16));
        assert!(matches!(second, Err(Error::OperationPending("read"))));

        // A write may still be issued alongside the read
        let (result, _) = channel.write_async(BytesMut::from(&b"x"[..])).unwrap().await;
        assert!(result.is_ok());

        channel.close();
        let (result, _) = pending.await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_cancels_outstanding_read() {
        let (a, _b) = duplex(64);
        let channel = Channel::new(a, None);

        let pending = channel.read_async(BytesMut::with_capacity(32)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close();
        channel.close();

        let (result, buf) = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("cancelled read must complete");
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(buf.capacity() >= 32);

        assert!(matches!(
            channel.read_async(BytesMut::with_capacity(8)),
            Err(Error::ChannelClosed)
        ));
        assert!(matches!(
            channel.write_async(BytesMut::new()),
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_write_signals_eof() {
        let (a, b) = duplex(64);
        let left = Channel::new(a, None);
        let right = Channel::new(b, None);

        left.shutdown_write().await.unwrap();
        let (result, _) = right.read_async(BytesMut::with_capacity(8)).unwrap().await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_drop_reads_eof() {
        let (a, b) = duplex(64);
        let channel = Channel::new(a, None);
        drop(b);

        let (result, _) = channel.read_async(BytesMut::with_capacity(8)).unwrap().await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_into_stream_detaches_transport() {
        let (a, mut b) = duplex(64);
        let channel = Channel::new(a, None);
        let other = channel.clone();

        let mut stream = channel.into_stream().unwrap();
        assert!(other.is_closed());

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_datagram_receive_and_cancel() {
        let channel = DatagramChannel::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_addr = sender.local_addr().unwrap();

        let pending = channel.receive_async(BytesMut::with_capacity(1500)).unwrap();
        sender.send_to(b"datagram", channel.local_addr()).await.unwrap();

        let datagram = pending.await.unwrap();
        assert_eq!(datagram.payload(), b"datagram");
        assert_eq!(datagram.len(), 8);
        assert_eq!(datagram.source(), sender_addr);
        assert_eq!(datagram.channel().local_addr(), channel.local_addr());

        let pending = channel.receive_async(BytesMut::with_capacity(1500)).unwrap();
        channel.close();
        assert!(matches!(pending.await, Err(Error::Cancelled)));
        assert!(matches!(
            channel.send_to(b"late", sender_addr).await,
            Err(Error::ChannelClosed)
        ));
    }
}
