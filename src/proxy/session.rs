//! What every proxy session shares: the session trait, the per-service
//! context sessions run within, and the upstream connector

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;
use uuid::Uuid;

use super::tunnel::TunnelingService;
use crate::channel::Channel;
use crate::config::{Config, ProviderKind, ServiceConfig};
use crate::protocol::DigestAuthenticator;
use crate::tls::SecureChannelProvider;
use crate::{Error, Result};

/// One client conversation handled by a proxy
#[async_trait]
pub trait ProxySession: Send + Sync {
    fn id(&self) -> Uuid;

    fn kind(&self) -> ProviderKind;

    /// Drive the session until it ends; errors have already been answered to
    /// the client where the protocol allows it
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Cancel the session by closing its channels; idempotent
    fn stop(&self);
}

/// Opens upstream connections on behalf of sessions
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, host: &str, port: u16) -> Result<Channel>;
}

/// Plain TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Channel> {
        let target = format!("{}:{}", host, port);
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                trace!("Connected to {}", target);
                Ok(Channel::from_tcp(stream))
            }
            Ok(Err(e)) => Err(Error::ConnectFailed(target, e)),
            Err(_) => Err(Error::ConnectTimeout(target)),
        }
    }
}

/// Limit on a TLS handshake with either a client or a remote
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state every session of one service runs with
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub service: Arc<ServiceConfig>,
    pub tunnels: TunnelingService,
    pub connector: Arc<dyn Connector>,
    pub tls: Arc<dyn SecureChannelProvider>,
    /// Present when the service requires Digest authentication
    pub authenticator: Option<Arc<DigestAuthenticator>>,
    pub buffer_size: usize,
    pub udp_idle_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl SessionContext {
    pub fn new(
        service: ServiceConfig,
        config: &Config,
        tunnels: TunnelingService,
        connector: Arc<dyn Connector>,
        tls: Arc<dyn SecureChannelProvider>,
    ) -> Self {
        let authenticator = service.credentials().map(|(user, pass)| {
            Arc::new(DigestAuthenticator::new(
                user,
                pass,
                service.realm.clone(),
                config.nonce_lifetime_secs,
            ))
        });
        Self {
            service: Arc::new(service),
            tunnels,
            connector,
            tls,
            authenticator,
            buffer_size: config.buffer_size,
            udp_idle_timeout: config.udp_idle_timeout(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Channels a session owns, closed together on stop
#[derive(Debug, Default)]
pub struct ChannelSet {
    channels: Mutex<Vec<Channel>>,
    stopped: AtomicBool,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `channel`; if the session was already stopped it is closed at once
    pub fn add(&self, channel: &Channel) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        if self.stopped.load(Ordering::Acquire) {
            channel.close();
            return Err(Error::Cancelled);
        }
        channels.retain(|c| !c.is_closed());
        channels.push(channel.clone());
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn close_all(&self) {
        let channels = {
            let mut channels = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            self.stopped.store(true, Ordering::Release);
            std::mem::take(&mut *channels)
        };
        for channel in channels {
            channel.close();
        }
    }
}

/// Accumulates reads from a channel so protocol heads can be parsed across
/// read boundaries
#[derive(Debug)]
pub struct ChannelReader {
    channel: Channel,
    buffered: BytesMut,
    chunk: Option<BytesMut>,
    chunk_size: usize,
}

impl ChannelReader {
    pub fn new(channel: Channel, chunk_size: usize) -> Self {
        Self {
            channel,
            buffered: BytesMut::new(),
            chunk: Some(BytesMut::with_capacity(chunk_size)),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffered
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffered
    }

    pub fn consume(&mut self, len: usize) {
        self.buffered.advance(len);
    }

    /// Everything read but not yet consumed
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buffered.split()
    }

    /// Issue one read and append what arrived; zero means end of stream
    pub async fn fill(&mut self) -> Result<usize> {
        let chunk = self
            .chunk
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_size));
        let (result, mut chunk) = self.channel.read_async(chunk)?.await;
        let n = result?;
        self.buffered.extend_from_slice(&chunk[..n]);
        if chunk.capacity() < self.chunk_size {
            chunk = BytesMut::with_capacity(self.chunk_size);
        }
        self.chunk = Some(chunk);
        Ok(n)
    }
}
