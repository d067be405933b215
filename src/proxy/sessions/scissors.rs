//! Fixed-destination relay ("scissors"): every client is spliced onto the
//! service's configured remote, over TCP (optionally TLS towards the remote)
//! or UDP.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::{Channel, Datagram, DatagramChannel};
use crate::config::ProviderKind;
use crate::proxy::session::{ChannelSet, ProxySession, SessionContext};
use crate::{Error, Result};

/// Datagrams waiting for a UDP session before newer ones are dropped
const UDP_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScissorsState {
    Connecting,
    TunnelEstablished,
    Closed,
}

fn remote_of(ctx: &SessionContext) -> Result<(String, u16)> {
    ctx.service
        .remote()
        .map(|(host, port)| (host.to_string(), port))
        .ok_or_else(|| {
            Error::invalid_config(format!("service {} has no remote", ctx.service.name))
        })
}

pub struct ScissorsSession {
    id: Uuid,
    ctx: SessionContext,
    client: Channel,
    channels: ChannelSet,
    state: Mutex<ScissorsState>,
}

impl ScissorsSession {
    pub fn new(ctx: SessionContext, client: Channel) -> Self {
        let channels = ChannelSet::new();
        let _ = channels.add(&client);
        Self {
            id: Uuid::new_v4(),
            ctx,
            client,
            channels,
            state: Mutex::new(ScissorsState::Connecting),
        }
    }

    pub fn state(&self) -> ScissorsState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ScissorsState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    async fn run(&self) -> Result<()> {
        let (host, port) = remote_of(&self.ctx)?;
        let upstream = self.ctx.connector.connect(&host, port).await?;
        self.channels.add(&upstream)?;

        let upstream = if self.ctx.service.remote_ssl {
            // Dropping the handshake on timeout drops the transport with it
            let handshake = self.ctx.tls.wrap_client(upstream, &host);
            let secure = match tokio::time::timeout(self.ctx.handshake_timeout, handshake).await {
                Ok(secure) => secure?,
                Err(_) => {
                    return Err(Error::TlsHandshake(format!(
                        "handshake with {}:{} timed out",
                        host, port
                    )));
                }
            };
            self.channels.add(&secure)?;
            secure
        } else {
            upstream
        };

        self.set_state(ScissorsState::TunnelEstablished);
        let tunnel = self.ctx.tunnels.bind(self.client.clone(), upstream)?;
        tunnel.finished().await;
        debug!(
            "Session {} relay to {}:{} done ({} bytes up, {} bytes down)",
            self.id,
            host,
            port,
            tunnel.bytes_up(),
            tunnel.bytes_down()
        );
        Ok(())
    }
}

#[async_trait]
impl ProxySession for ScissorsSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Scissors
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        debug!("Session {} started for {:?}", self.id, self.client.peer_addr());
        let result = self.run().await;
        if let Err(e) = &result {
            warn!("Session {} could not reach remote: {}", self.id, e);
        }
        self.channels.close_all();
        self.set_state(ScissorsState::Closed);
        result
    }

    fn stop(&self) {
        self.channels.close_all();
    }
}

/// Relay for one client address of a UDP scissors service
///
/// The listener feeds it the client's datagrams through [`deliver`]; replies
/// from the remote go back out through the listener socket. The session ends
/// after a period without traffic in either direction.
///
/// [`deliver`]: UdpScissorsSession::deliver
pub struct UdpScissorsSession {
    id: Uuid,
    ctx: SessionContext,
    listener: DatagramChannel,
    client: SocketAddr,
    queue: mpsc::Sender<Bytes>,
    pending: Mutex<Option<mpsc::Receiver<Bytes>>>,
    upstream: Mutex<Option<DatagramChannel>>,
    cancel: CancellationToken,
    state: Mutex<ScissorsState>,
}

impl UdpScissorsSession {
    pub fn new(ctx: SessionContext, listener: DatagramChannel, client: SocketAddr) -> Self {
        let (queue, pending) = mpsc::channel(UDP_QUEUE_DEPTH);
        Self {
            id: Uuid::new_v4(),
            ctx,
            listener,
            client,
            queue,
            pending: Mutex::new(Some(pending)),
            upstream: Mutex::new(None),
            cancel: CancellationToken::new(),
            state: Mutex::new(ScissorsState::Connecting),
        }
    }

    pub fn state(&self) -> ScissorsState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ScissorsState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Queue a datagram from the client; false once the session has ended
    pub fn deliver(&self, datagram: Datagram) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        match self.queue.try_send(datagram.into_payload()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("Session {} queue full, dropping datagram", self.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn run(&self) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| Error::internal("UDP session started twice"))?;

        let (host, port) = remote_of(&self.ctx)?;
        let remote = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::ConnectFailed(
                    format!("{}:{}", host, port),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address"),
                )
            })?;
        let local = match remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let upstream = DatagramChannel::bind(SocketAddr::new(local, 0)).await?;
        {
            let mut slot = self.upstream.lock().unwrap_or_else(|p| p.into_inner());
            if self.cancel.is_cancelled() {
                upstream.close();
                return Err(Error::Cancelled);
            }
            *slot = Some(upstream.clone());
        }

        self.set_state(ScissorsState::TunnelEstablished);
        debug!("Session {} relaying {} <-> {}", self.id, self.client, remote);
        let result = self.relay(&upstream, remote, &mut pending).await;
        upstream.close();
        result
    }

    async fn relay(
        &self,
        upstream: &DatagramChannel,
        remote: SocketAddr,
        pending: &mut mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        let idle = self.ctx.udp_idle_timeout;
        let mut replies = upstream.receive_async(BytesMut::with_capacity(self.ctx.buffer_size))?;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                payload = pending.recv() => match payload {
                    Some(payload) => {
                        upstream.send_to(&payload, remote).await?;
                    }
                    None => return Ok(()),
                },
                received = &mut replies => {
                    let reply = received?;
                    replies = upstream.receive_async(BytesMut::with_capacity(self.ctx.buffer_size))?;
                    if reply.source() == remote {
                        self.listener.send_to(reply.payload(), self.client).await?;
                    } else {
                        trace!("Session {} ignoring datagram from {}", self.id, reply.source());
                    }
                }
                _ = tokio::time::sleep(idle) => {
                    debug!("Session {} idle for {:?}", self.id, idle);
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl ProxySession for UdpScissorsSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Scissors
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let result = self.run().await;
        self.stop();
        self.set_state(ScissorsState::Closed);
        result
    }

    fn stop(&self) {
        let upstream = {
            let mut slot = self.upstream.lock().unwrap_or_else(|p| p.into_inner());
            self.cancel.cancel();
            slot.take()
        };
        if let Some(upstream) = upstream {
            upstream.close();
        }
    }
}
