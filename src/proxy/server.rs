//! Per-service listener
//!
//! A [`ProxyServer`] owns one listening socket, turns accepted connections (or
//! datagram sources) into sessions of the service's provider kind, and keeps
//! them in a registry so `stop()` can cancel and drain them.

use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::Registry;
use super::session::{ProxySession, SessionContext};
use super::sessions::{
    HttpProxySession, ScissorsSession, ScissorsState, SocksProxySession, UdpScissorsSession,
};
use crate::certs::{Certificate, CertificateStore};
use crate::channel::{Channel, DatagramChannel};
use crate::config::{ProviderKind, Transport};
use crate::{Error, Result};

type SessionTable = Registry<Arc<dyn ProxySession>>;

pub struct ProxyServer {
    ctx: SessionContext,
    certs: Option<Arc<CertificateStore>>,
    sessions: SessionTable,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("service", &self.ctx.service.name)
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ProxyServer {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            certs: None,
            sessions: Registry::new(),
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Source of self-signed certificates for TLS listeners without PEM files
    pub fn with_certificates(mut self, certs: Arc<CertificateStore>) -> Self {
        self.certs = Some(certs);
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.service.name
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Bind the listener and start accepting in the background
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let service = &self.ctx.service;
        let listen = service.listen_addr();

        let local_addr = match service.transport {
            Transport::Udp => {
                let addr = tokio::net::lookup_host(listen.as_str())
                    .await?
                    .next()
                    .ok_or_else(|| Error::invalid_config(format!("cannot resolve {}", listen)))?;
                let socket = DatagramChannel::bind(addr).await?;
                let local_addr = socket.local_addr();
                tokio::spawn(self.clone().datagram_loop(socket));
                local_addr
            }
            Transport::Tcp | Transport::Tls => {
                let certificate = match service.transport {
                    Transport::Tls => Some(self.listener_certificate().await?),
                    _ => None,
                };
                let listener = TcpListener::bind(listen.as_str()).await?;
                let local_addr = listener.local_addr()?;
                tokio::spawn(self.clone().accept_loop(listener, certificate));
                local_addr
            }
        };

        *self.local_addr.lock().unwrap_or_else(|p| p.into_inner()) = Some(local_addr);
        info!(
            "{} proxy {:?} listening on {} ({:?})",
            service.name, service.provider, local_addr, service.transport
        );
        Ok(local_addr)
    }

    async fn listener_certificate(&self) -> Result<Certificate> {
        let service = &self.ctx.service;
        if let (Some(cert_path), Some(key_path)) = (&service.cert_path, &service.key_path) {
            return Certificate::from_pem_files(cert_path, key_path);
        }
        match &self.certs {
            Some(store) => store.get_cert_for_host(&service.bind_address).await,
            None => Err(Error::invalid_config(format!(
                "service {} needs cert_path/key_path or a certificate store",
                service.name
            ))),
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, certificate: Option<Certificate>) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("{}: connection from {}", self.name(), peer);
                    let server = self.clone();
                    let certificate = certificate.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, certificate).await;
                    });
                }
                Err(e) => {
                    error!("{}: error accepting connection: {}", self.name(), e);
                }
            }
        }
        debug!("{}: listener closed", self.name());
    }

    async fn handle_connection(&self, stream: TcpStream, certificate: Option<Certificate>) {
        let mut channel = Channel::from_tcp(stream);
        if let Some(certificate) = certificate {
            let peer = channel.peer_addr();
            let handshake = self.ctx.tls.wrap_server(channel, &certificate);
            channel = match tokio::time::timeout(self.ctx.handshake_timeout, handshake).await {
                Ok(Ok(secure)) => secure,
                Ok(Err(e)) => {
                    debug!("{}: TLS handshake with {:?} failed: {}", self.name(), peer, e);
                    return;
                }
                Err(_) => {
                    debug!("{}: TLS handshake with {:?} timed out", self.name(), peer);
                    return;
                }
            };
        }

        let session: Arc<dyn ProxySession> = match self.ctx.service.provider {
            ProviderKind::Http => Arc::new(HttpProxySession::new(self.ctx.clone(), channel)),
            ProviderKind::Socks => Arc::new(SocksProxySession::new(self.ctx.clone(), channel)),
            ProviderKind::Scissors => Arc::new(ScissorsSession::new(self.ctx.clone(), channel)),
        };
        self.run_session(session).await;
    }

    async fn datagram_loop(self: Arc<Self>, listener: DatagramChannel) {
        let mut flows: HashMap<SocketAddr, Arc<UdpScissorsSession>> = HashMap::new();

        loop {
            let receive = match listener.receive_async(BytesMut::with_capacity(self.ctx.buffer_size)) {
                Ok(receive) => receive,
                Err(e) => {
                    debug!("{}: datagram listener stopped: {}", self.name(), e);
                    break;
                }
            };
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = receive => received,
            };
            let datagram = match received {
                Ok(datagram) => datagram,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!("{}: receive failed: {}", self.name(), e);
                    continue;
                }
            };

            let source = datagram.source();
            if let Some(session) = flows.get(&source) {
                if session.deliver(datagram.clone()) {
                    continue;
                }
            }

            flows.retain(|_, session| session.state() != ScissorsState::Closed);
            let session = Arc::new(UdpScissorsSession::new(
                self.ctx.clone(),
                listener.clone(),
                source,
            ));
            session.deliver(datagram);
            flows.insert(source, session.clone());

            let server = self.clone();
            tokio::spawn(async move {
                server.run_session(session).await;
            });
        }

        listener.close();
        debug!("{}: datagram listener closed", self.name());
    }

    async fn run_session(&self, session: Arc<dyn ProxySession>) {
        let id = match self.sessions.insert(session.clone()) {
            Ok(id) => id,
            Err(_) => {
                session.stop();
                return;
            }
        };

        let session_id = session.id();
        match session.clone().start().await {
            Ok(()) => debug!("Session {} finished", session_id),
            Err(e) if e.is_cancelled() => debug!("Session {} cancelled", session_id),
            Err(e) => debug!("Session {} ended: {}", session_id, e),
        }
        self.sessions.remove(id);
    }

    /// Stop accepting, cancel every session and wait for them to end
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sessions.begin_drain();

        let sessions = self.sessions.snapshot();
        info!("Stopping {} ({} active sessions)", self.name(), sessions.len());
        for session in sessions {
            session.stop();
        }
        self.sessions.drained().await;
        debug!("{}: all sessions ended", self.name());
    }
}
