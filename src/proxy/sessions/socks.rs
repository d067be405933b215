//! SOCKS4/4a proxy session, including the UDP relay association

use async_trait::async_trait;
use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::channel::{Channel, Datagram, DatagramChannel};
use crate::config::ProviderKind;
use crate::protocol::socks::{decode_udp_envelope, encode_udp_envelope};
use crate::protocol::{Socks4Codec, SocksCommand, SocksReply, SocksRequest, SocksTarget};
use crate::proxy::session::{ChannelReader, ChannelSet, ProxySession, SessionContext};
use crate::{Error, Result};

/// Requests are short; the read size only bounds one read
const REQUEST_READ_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksSessionState {
    AwaitingGreeting,
    AwaitingRequest,
    Connecting,
    Relaying,
    AwaitingDatagram,
    Closed,
}

pub struct SocksProxySession {
    id: Uuid,
    ctx: SessionContext,
    client: Channel,
    channels: ChannelSet,
    relay: Mutex<Option<DatagramChannel>>,
    state: Mutex<SocksSessionState>,
}

impl SocksProxySession {
    pub fn new(ctx: SessionContext, client: Channel) -> Self {
        let channels = ChannelSet::new();
        let _ = channels.add(&client);
        Self {
            id: Uuid::new_v4(),
            ctx,
            client,
            channels,
            relay: Mutex::new(None),
            state: Mutex::new(SocksSessionState::AwaitingGreeting),
        }
    }

    pub fn state(&self) -> SocksSessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SocksSessionState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != state {
            trace!("Session {} {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    async fn run(&self) -> Result<()> {
        let mut reader = ChannelReader::new(self.client.clone(), REQUEST_READ_SIZE);
        let request = match self.read_request(&mut reader).await? {
            Some(request) => request,
            None => return Ok(()),
        };
        debug!(
            "Session {} {:?} {} (user id {:?})",
            self.id, request.command, request.target, request.user_id
        );

        if !self.ctx.service.user_id_allowed(&request.user_id) {
            warn!("Session {} rejected user id {:?}", self.id, request.user_id);
            self.send_reply(SocksReply::failed()).await;
            return Err(Error::auth(format!("user id {:?} not allowed", request.user_id)));
        }

        match request.command {
            SocksCommand::Connect => self.connect(request, &mut reader).await,
            SocksCommand::UdpAssociate => self.associate().await,
            command => {
                self.send_reply(SocksReply::failed()).await;
                Err(Error::protocol(format!("unsupported SOCKS command {:?}", command)))
            }
        }
    }

    async fn read_request(&self, reader: &mut ChannelReader) -> Result<Option<SocksRequest>> {
        let mut codec = Socks4Codec::new();
        loop {
            match codec.decode(reader.buffer_mut()) {
                Ok(Some(request)) => return Ok(Some(request)),
                Ok(None) => {}
                Err(e) => {
                    self.send_reply(SocksReply::failed()).await;
                    return Err(e);
                }
            }

            // Past the version byte the rest is the request proper
            if !reader.buffered().is_empty() {
                self.set_state(SocksSessionState::AwaitingRequest);
            }
            if reader.fill().await? == 0 {
                if reader.buffered().is_empty() {
                    return Ok(None);
                }
                return Err(Error::protocol("client closed mid-request"));
            }
        }
    }

    async fn connect(&self, request: SocksRequest, reader: &mut ChannelReader) -> Result<()> {
        self.set_state(SocksSessionState::Connecting);
        let host = request.target.host();
        let port = request.target.port();

        let upstream = match self.ctx.connector.connect(&host, port).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Session {} upstream {}:{} unavailable: {}", self.id, host, port, e);
                self.send_reply(SocksReply::failed()).await;
                return Err(e);
            }
        };
        self.channels.add(&upstream)?;

        let bound = match request.target {
            SocksTarget::Ip(addr) => addr,
            SocksTarget::Domain(_, port) => match upstream.peer_addr() {
                Some(SocketAddr::V4(addr)) => addr,
                _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
            },
        };
        self.write_reply(SocksReply::granted(bound)).await?;

        let early = reader.take_buffered();
        if !early.is_empty() {
            upstream.write_all(&early).await?;
        }

        self.set_state(SocksSessionState::Relaying);
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

    /// Relay datagrams until the control connection closes
    async fn associate(&self) -> Result<()> {
        self.set_state(SocksSessionState::Connecting);
        let ip = self
            .ctx
            .service
            .bind_address
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let relay = match DatagramChannel::bind(SocketAddr::new(ip, 0)).await {
            Ok(relay) => relay,
            Err(e) => {
                self.send_reply(SocksReply::failed()).await;
                return Err(e);
            }
        };
        self.track_relay(&relay)?;

        let relay_addr = match relay.local_addr() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                relay.close();
                self.send_reply(SocksReply::failed()).await;
                return Err(Error::protocol("UDP relay needs an IPv4 bind address"));
            }
        };
        self.write_reply(SocksReply::granted(relay_addr)).await?;
        debug!("Session {} relaying datagrams on {}", self.id, relay_addr);

        self.set_state(SocksSessionState::AwaitingDatagram);
        let result = self.relay_datagrams(&relay).await;
        relay.close();
        result
    }

    async fn relay_datagrams(&self, relay: &DatagramChannel) -> Result<()> {
        let mut control = self.client.read_async(BytesMut::with_capacity(64))?;
        let mut incoming = relay.receive_async(BytesMut::with_capacity(self.ctx.buffer_size))?;
        let mut client_addr: Option<SocketAddr> = None;

        loop {
            tokio::select! {
                (result, buf) = &mut control => {
                    if result? == 0 {
                        debug!("Session {} control connection closed", self.id);
                        return Ok(());
                    }
                    // Anything sent on the control connection is ignored
                    control = self.client.read_async(buf)?;
                }
                received = &mut incoming => {
                    let datagram = received?;
                    incoming = relay.receive_async(BytesMut::with_capacity(self.ctx.buffer_size))?;
                    if let Err(e) = self.relay_datagram(relay, datagram, &mut client_addr).await {
                        if e.is_cancelled() {
                            return Err(e);
                        }
                        debug!("Session {} dropped datagram: {}", self.id, e);
                    }
                }
            }
        }
    }

    async fn relay_datagram(
        &self,
        relay: &DatagramChannel,
        datagram: Datagram,
        client_addr: &mut Option<SocketAddr>,
    ) -> Result<()> {
        let source = datagram.source();
        let from_client = match client_addr {
            Some(addr) => *addr == source,
            // The first datagram from the control connection's host names the client
            None => self
                .client
                .peer_addr()
                .map_or(true, |peer| peer.ip() == source.ip()),
        };

        if from_client {
            match decode_udp_envelope(datagram.payload())? {
                Some((peer, payload)) => {
                    *client_addr = Some(source);
                    trace!("Session {} {} bytes to {}", self.id, payload.len(), peer);
                    relay.send_to(payload, SocketAddr::V4(peer)).await?;
                }
                None => trace!("Session {} dropping fragmented datagram", self.id),
            }
            return Ok(());
        }

        match (*client_addr, source) {
            (Some(client), SocketAddr::V4(peer)) => {
                let mut out = BytesMut::new();
                encode_udp_envelope(peer, datagram.payload(), &mut out);
                relay.send_to(&out, client).await?;
            }
            _ => trace!("Session {} dropping datagram from {}", self.id, source),
        }
        Ok(())
    }

    fn track_relay(&self, relay: &DatagramChannel) -> Result<()> {
        let mut slot = self.relay.lock().unwrap_or_else(|p| p.into_inner());
        if self.channels.is_stopped() {
            relay.close();
            return Err(Error::Cancelled);
        }
        *slot = Some(relay.clone());
        Ok(())
    }

    async fn write_reply(&self, reply: SocksReply) -> Result<()> {
        let mut out = BytesMut::new();
        Socks4Codec::new().encode(reply, &mut out)?;
        self.client.write_all(&out).await
    }

    /// Best-effort reply ahead of closing
    async fn send_reply(&self, reply: SocksReply) {
        if let Err(e) = self.write_reply(reply).await {
            trace!("Session {} could not send reply: {}", self.id, e);
        }
    }
}

#[async_trait]
impl ProxySession for SocksProxySession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Socks
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        debug!("Session {} started for {:?}", self.id, self.client.peer_addr());
        let result = self.run().await;
        self.stop();
        self.set_state(SocksSessionState::Closed);
        result
    }

    fn stop(&self) {
        let relay = {
            let mut slot = self.relay.lock().unwrap_or_else(|p| p.into_inner());
            self.channels.close_all();
            slot.take()
        };
        if let Some(relay) = relay {
            relay.close();
        }
    }
}
