//! Bidirectional byte relay between two channels
//!
//! A [`TunnelingService`] owns the table of active tunnels. Each tunnel runs one
//! pump per direction with its own fixed buffer; the tunnel is torn down once
//! both pumps have ended, by a task separate from the pump that noticed it.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::registry::{EntryId, Registry};
use crate::channel::Channel;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    /// One direction reached end of stream; the other still relays
    HalfClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Upstream,
    Downstream,
}

#[derive(Debug)]
struct Tunnel {
    client: Channel,
    upstream: Channel,
    state: Mutex<TunnelState>,
    pumps_running: AtomicUsize,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    finished: CancellationToken,
}

impl Tunnel {
    fn set_state(&self, state: TunnelState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != TunnelState::Closed {
            *current = state;
        }
    }

    fn state(&self) -> TunnelState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close_both(&self) {
        self.client.close();
        self.upstream.close();
    }
}

#[derive(Debug)]
struct ServiceInner {
    buffer_size: usize,
    table: Registry<Arc<Tunnel>>,
}

/// Relay manager shared by every proxy of a process
#[derive(Debug, Clone)]
pub struct TunnelingService {
    inner: Arc<ServiceInner>,
}

/// Caller's view of a bound tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    id: EntryId,
    tunnel: Arc<Tunnel>,
}

impl TunnelHandle {
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.tunnel.state()
    }

    pub fn bytes_up(&self) -> u64 {
        self.tunnel.bytes_up.load(Ordering::Relaxed)
    }

    pub fn bytes_down(&self) -> u64 {
        self.tunnel.bytes_down.load(Ordering::Relaxed)
    }

    /// Resolve once the tunnel was torn down and left the table
    pub async fn finished(&self) {
        self.tunnel.finished.cancelled().await
    }
}

impl TunnelingService {
    /// Create the service; every tunnel gets one `buffer_size` buffer per direction
    pub fn init(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                buffer_size: buffer_size.max(1),
                table: Registry::new(),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of tunnels currently in the table
    pub fn active(&self) -> usize {
        self.inner.table.len()
    }

    /// Start relaying between `client` and `upstream`
    ///
    /// Ownership of both channels passes to the tunnel, which closes them when
    /// it ends. Fails with `ShuttingDown` once [`term`](Self::term) has begun;
    /// the channels are left untouched in that case.
    pub fn bind(&self, client: Channel, upstream: Channel) -> Result<TunnelHandle> {
        let tunnel = Arc::new(Tunnel {
            client,
            upstream,
            state: Mutex::new(TunnelState::Open),
            pumps_running: AtomicUsize::new(2),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            finished: CancellationToken::new(),
        });
        // Registered before the first read is issued
        let id = self.inner.table.insert(tunnel.clone())?;
        debug!(
            "Tunnel {} opened: {:?} <-> {:?}",
            id,
            tunnel.client.peer_addr(),
            tunnel.upstream.peer_addr()
        );

        for direction in [Direction::Upstream, Direction::Downstream] {
            let service = self.clone();
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                service.pump(id, tunnel, direction).await;
            });
        }

        Ok(TunnelHandle { id, tunnel })
    }

    /// Stop accepting tunnels and wait until every active tunnel has ended
    pub async fn term(&self) {
        self.inner.table.begin_drain();
        debug!("Tunneling service draining {} tunnel(s)", self.active());
        self.inner.table.drained().await;
    }

    async fn pump(&self, id: EntryId, tunnel: Arc<Tunnel>, direction: Direction) {
        let (from, to, counter) = match direction {
            Direction::Upstream => (&tunnel.client, &tunnel.upstream, &tunnel.bytes_up),
            Direction::Downstream => (&tunnel.upstream, &tunnel.client, &tunnel.bytes_down),
        };

        match relay(from, to, counter, self.inner.buffer_size).await {
            Ok(()) => {
                trace!("Tunnel {} {:?} reached end of stream", id, direction);
                tunnel.set_state(TunnelState::HalfClosed);
                if let Err(e) = to.shutdown_write().await {
                    if !e.is_cancelled() {
                        debug!("Tunnel {} half-close failed: {}", id, e);
                    }
                    tunnel.close_both();
                }
            }
            Err(e) => {
                if !e.is_cancelled() {
                    debug!("Tunnel {} {:?} failed: {}", id, direction, e);
                }
                tunnel.close_both();
            }
        }

        if tunnel.pumps_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            let service = self.clone();
            tokio::spawn(async move { service.teardown(id, tunnel) });
        }
    }

    fn teardown(&self, id: EntryId, tunnel: Arc<Tunnel>) {
        tunnel.close_both();
        tunnel.set_state(TunnelState::Closed);
        if self.inner.table.remove(id).is_some() {
            debug!(
                "Tunnel {} closed ({} bytes up, {} bytes down)",
                id,
                tunnel.bytes_up.load(Ordering::Relaxed),
                tunnel.bytes_down.load(Ordering::Relaxed)
            );
        }
        tunnel.finished.cancel();
    }
}

/// Copy `from` into `to` until end of stream; errors include cancellation
async fn relay(from: &Channel, to: &Channel, counter: &AtomicU64, buffer_size: usize) -> Result<()> {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        let (read, returned) = from.read_async(buf)?.await;
        buf = returned;
        let n = read?;
        if n == 0 {
            return Ok(());
        }

        let (written, returned) = to.write_async(buf)?.await;
        buf = returned;
        written?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Tunnel between two in-memory pairs; returns the outer ends
    fn bound(service: &TunnelingService) -> (TunnelHandle, DuplexStream, DuplexStream) {
        let (client_outer, client_inner) = duplex(1024);
        let (upstream_inner, upstream_outer) = duplex(1024);
        let handle = service
            .bind(
                Channel::new(client_inner, None),
                Channel::new(upstream_inner, None),
            )
            .unwrap();
        (handle, client_outer, upstream_outer)
    }

    async fn finished(handle: &TunnelHandle) {
        tokio::time::timeout(Duration::from_secs(2), handle.finished())
            .await
            .expect("tunnel must finish");
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let service = TunnelingService::init(16);
        let (handle, mut client, mut upstream) = bound(&service);
        assert_eq!(service.active(), 1);

        let request = b"a request larger than one sixteen byte buffer";
        client.write_all(request).await.unwrap();
        let mut buf = vec![0u8; request.len()];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &request[..]);

        upstream.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(client);
        drop(upstream);
        finished(&handle).await;
        assert_eq!(handle.bytes_up(), request.len() as u64);
        assert_eq!(handle.bytes_down(), 5);
    }

    #[tokio::test]
    async fn test_eof_half_closes_peer() {
        let service = TunnelingService::init(64);
        let (handle, mut client, mut upstream) = bound(&service);

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        upstream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // The other direction keeps flowing
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), TunnelState::HalfClosed);
        upstream.write_all(b"late reply").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late reply");
        assert_eq!(service.active(), 1);

        upstream.shutdown().await.unwrap();
        finished(&handle).await;
        assert_eq!(handle.state(), TunnelState::Closed);
        assert_eq!(service.active(), 0);
    }

    #[tokio::test]
    async fn test_closing_one_channel_ends_both_directions() {
        let service = TunnelingService::init(64);
        let (client_outer, client_inner) = duplex(64);
        let (upstream_inner, mut upstream_outer) = duplex(64);
        let client = Channel::new(client_inner, None);
        let handle = service
            .bind(client.clone(), Channel::new(upstream_inner, None))
            .unwrap();

        client.close();
        finished(&handle).await;
        assert_eq!(service.active(), 0);

        let mut rest = Vec::new();
        upstream_outer.read_to_end(&mut rest).await.unwrap();
        drop(client_outer);
    }

    #[tokio::test]
    async fn test_term_drains_and_rejects_new_tunnels() {
        let service = TunnelingService::init(64);
        let (first, client_a, upstream_a) = bound(&service);
        let (second, client_b, upstream_b) = bound(&service);
        assert_eq!(service.active(), 2);

        let drain = {
            let service = service.clone();
            tokio::spawn(async move { service.term().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drain.is_finished());

        let (a, b) = duplex(8);
        let refused = service.bind(Channel::new(a, None), Channel::new(b, None));
        assert!(matches!(refused, Err(Error::ShuttingDown)));

        drop(client_a);
        drop(upstream_a);
        finished(&first).await;
        assert_eq!(service.active(), 1);
        assert!(!drain.is_finished());

        drop(client_b);
        drop(upstream_b);
        finished(&second).await;
        tokio::time::timeout(Duration::from_secs(2), drain)
            .await
            .expect("term must resolve once the table is empty")
            .unwrap();
        assert_eq!(service.active(), 0);
    }
}
