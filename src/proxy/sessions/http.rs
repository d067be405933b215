//! Forwarding HTTP/1.1 proxy session
//!
//! Handles `CONNECT` by tunneling and every other method by forwarding the
//! request to the origin with hop-by-hop headers rewritten. Bodies are
//! streamed: fixed-length bodies byte for byte, chunked bodies decoded and
//! re-chunked, close-delimited responses until the upstream closes.

use async_trait::async_trait;
use bytes::BytesMut;
use http::StatusCode;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::{split_host_port, ProviderKind};
use crate::protocol::{
    encode_chunk, encode_last_chunk, make_error_response, parse_request_head,
    parse_response_head, AuthOutcome, BodyFraming, ChunkedDecoder, RequestHead, ResponseHead,
    MAX_HEAD_SIZE,
};
use crate::proxy::session::{ChannelReader, ChannelSet, ProxySession, SessionContext};
use crate::{Error, Result};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpSessionState {
    AwaitingRequestLine,
    AwaitingHeaders,
    Authenticating,
    Connecting,
    TunnelEstablished,
    RelayingBody,
    Closed,
}

/// What the client connection does after one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    KeepAlive,
    Close,
}

/// Outcome of relaying one request over an upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relayed {
    /// The client's fate and whether the upstream can be reused
    Done(Exchange, bool),
    /// A reused upstream closed before answering; nothing reached the client
    Stale,
}

/// Upstream connection kept between requests to the same authority
#[derive(Debug)]
struct Upstream {
    host: String,
    port: u16,
    reader: ChannelReader,
}

impl Upstream {
    fn serves(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port == port && !self.reader.channel().is_closed()
    }
}

pub struct HttpProxySession {
    id: Uuid,
    ctx: SessionContext,
    client: Channel,
    channels: ChannelSet,
    state: Mutex<HttpSessionState>,
}

impl HttpProxySession {
    pub fn new(ctx: SessionContext, client: Channel) -> Self {
        let channels = ChannelSet::new();
        // A fresh set is never stopped
        let _ = channels.add(&client);
        Self {
            id: Uuid::new_v4(),
            ctx,
            client,
            channels,
            state: Mutex::new(HttpSessionState::AwaitingRequestLine),
        }
    }

    pub fn state(&self) -> HttpSessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: HttpSessionState) {
        let mut current = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *current != state {
            trace!("Session {} {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    async fn run(&self) -> Result<()> {
        let mut client = ChannelReader::new(self.client.clone(), self.ctx.buffer_size);
        let mut upstream: Option<Upstream> = None;

        let result = loop {
            match self.exchange(&mut client, &mut upstream).await {
                Ok(Exchange::KeepAlive) => continue,
                Ok(Exchange::Close) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Some(upstream) = upstream {
            upstream.reader.channel().close();
        }
        result
    }

    /// Serve one request
    async fn exchange(
        &self,
        client: &mut ChannelReader,
        upstream: &mut Option<Upstream>,
    ) -> Result<Exchange> {
        self.set_state(HttpSessionState::AwaitingRequestLine);
        let head = match self.read_request_head(client).await? {
            Some(head) => head,
            None => return Ok(Exchange::Close),
        };
        debug!("Session {} {} {}", self.id, head.method, head.target);

        if let Some(authenticator) = &self.ctx.authenticator {
            self.set_state(HttpSessionState::Authenticating);
            let outcome = authenticator.verify(
                &head.method,
                &head.target,
                head.headers.get("Proxy-Authorization"),
            );
            if let AuthOutcome::Challenge { stale } = outcome {
                return self.challenge(head, client, stale).await;
            }
        }

        if head.is_connect() {
            if let Some(old) = upstream.take() {
                old.reader.channel().close();
            }
            return self.tunnel(head, client).await;
        }
        self.forward(head, client, upstream).await
    }

    async fn read_request_head(&self, client: &mut ChannelReader) -> Result<Option<RequestHead>> {
        loop {
            match parse_request_head(client.buffered()) {
                Ok(Some((head, len))) => {
                    client.consume(len);
                    return Ok(Some(head));
                }
                Ok(None) => {}
                Err(e) => {
                    let status = if client.buffered().len() > MAX_HEAD_SIZE {
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                    } else {
                        status_for(&e)
                    };
                    self.send_error(status, &e.to_string(), &[], false).await;
                    return Err(e);
                }
            }

            if !client.buffered().is_empty() {
                self.set_state(HttpSessionState::AwaitingHeaders);
            }
            if client.fill().await? == 0 {
                if client.buffered().is_empty() {
                    return Ok(None);
                }
                return Err(Error::invalid_request("client closed mid-request"));
            }
        }
    }

    /// Answer with 407 after discarding the request body
    async fn challenge(
        &self,
        head: RequestHead,
        client: &mut ChannelReader,
        stale: bool,
    ) -> Result<Exchange> {
        debug!("Session {} authentication required (stale: {})", self.id, stale);
        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(e) => {
                self.send_error(StatusCode::BAD_REQUEST, &e.to_string(), &[], false).await;
                return Err(e);
            }
        };
        relay_body(client, None, framing).await?;

        let keep_alive = head.keep_alive();
        let challenge = match &self.ctx.authenticator {
            Some(authenticator) => authenticator.challenge(stale),
            None => return Err(Error::internal("challenge without an authenticator")),
        };
        let response = make_error_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "Proxy authentication required",
            &[("Proxy-Authenticate", challenge)],
            keep_alive,
        );
        self.client.write_all(&response).await?;
        Ok(if keep_alive {
            Exchange::KeepAlive
        } else {
            Exchange::Close
        })
    }

    async fn tunnel(&self, head: RequestHead, client: &mut ChannelReader) -> Result<Exchange> {
        let (host, port) = match split_host_port(&head.target) {
            Some(target) => target,
            None => {
                let e = Error::invalid_request(format!("bad CONNECT target {}", head.target));
                self.send_error(StatusCode::BAD_REQUEST, &e.to_string(), &[], false).await;
                return Err(e);
            }
        };

        self.set_state(HttpSessionState::Connecting);
        let upstream = self.open_upstream(host, port).await?;

        self.client.write_all(CONNECT_ESTABLISHED).await?;
        let early = client.take_buffered();
        if !early.is_empty() {
            trace!("Session {} flushing {} early bytes", self.id, early.len());
            upstream.write_all(&early).await?;
        }

        self.set_state(HttpSessionState::TunnelEstablished);
        let tunnel = self.ctx.tunnels.bind(self.client.clone(), upstream)?;
        tunnel.finished().await;
        debug!(
            "Session {} tunnel to {}:{} done ({} bytes up, {} bytes down)",
            self.id,
            host,
            port,
            tunnel.bytes_up(),
            tunnel.bytes_down()
        );
        Ok(Exchange::Close)
    }

    async fn forward(
        &self,
        head: RequestHead,
        client: &mut ChannelReader,
        upstream: &mut Option<Upstream>,
    ) -> Result<Exchange> {
        let prepared = self
            .resolve_target(&head)
            .and_then(|target| head.framing().map(|framing| (target, framing)));
        let ((host, port, path), framing) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.send_error(status_for(&e), &e.to_string(), &[], false).await;
                return Err(e);
            }
        };

        self.set_state(HttpSessionState::Connecting);
        // An idle upstream may have been closed by the origin; only requests
        // that can be sent again are put on one
        let reused = match upstream.take() {
            Some(existing) if existing.serves(&host, port) && is_replayable(framing) => {
                trace!("Session {} reusing connection to {}:{}", self.id, host, port);
                Some(existing)
            }
            other => {
                if let Some(old) = other {
                    old.reader.channel().close();
                }
                None
            }
        };
        let body = match (&reused, framing) {
            (Some(_), BodyFraming::Length(len)) => match read_body(client, len).await {
                Ok(body) => Some(body),
                Err(e) => {
                    if let Some(old) = &reused {
                        old.reader.channel().close();
                    }
                    self.send_error(status_for(&e), &e.to_string(), &[], false).await;
                    return Err(e);
                }
            },
            (Some(_), _) => Some(BytesMut::new()),
            (None, _) => None,
        };

        let mut replayable = reused.is_some();
        let mut conn = match reused {
            Some(existing) => existing,
            None => self.connect_upstream(&host, port).await?,
        };
        loop {
            let relayed = self
                .relay_exchange(&head, &path, framing, body.as_deref(), client, &mut conn, replayable)
                .await;
            match relayed {
                Ok(Relayed::Done(exchange, reusable)) => {
                    if reusable && exchange == Exchange::KeepAlive {
                        *upstream = Some(conn);
                    } else {
                        conn.reader.channel().close();
                    }
                    return Ok(exchange);
                }
                Ok(Relayed::Stale) => {
                    debug!(
                        "Session {} idle connection to {}:{} went away, reconnecting",
                        self.id, host, port
                    );
                    conn.reader.channel().close();
                    conn = self.connect_upstream(&host, port).await?;
                    replayable = false;
                }
                Err(e) => {
                    conn.reader.channel().close();
                    return Err(e);
                }
            }
        }
    }

    async fn connect_upstream(&self, host: &str, port: u16) -> Result<Upstream> {
        let channel = self.open_upstream(host, port).await?;
        Ok(Upstream {
            host: host.to_string(),
            port,
            reader: ChannelReader::new(channel, self.ctx.buffer_size),
        })
    }

    /// Send the request upstream and relay the response back
    ///
    /// `body` carries an already buffered request body; without it the body
    /// is streamed from the client. When `replayable` is set, a connection
    /// that fails before yielding any response byte is reported as
    /// [`Relayed::Stale`] instead of answering the client.
    #[allow(clippy::too_many_arguments)]
    async fn relay_exchange(
        &self,
        head: &RequestHead,
        path: &str,
        framing: BodyFraming,
        body: Option<&[u8]>,
        client: &mut ChannelReader,
        conn: &mut Upstream,
        replayable: bool,
    ) -> Result<Relayed> {
        let mut request = RequestHead {
            method: head.method.clone(),
            target: path.to_string(),
            version: head.version,
            headers: head.headers.clone(),
        };
        request.headers.remove_hop_by_hop();
        if framing == BodyFraming::Chunked {
            request.headers.add("Transfer-Encoding", "chunked");
        }

        self.set_state(HttpSessionState::RelayingBody);
        let mut out = BytesMut::new();
        request.write_to(&mut out);
        let sent = match body {
            Some(body) => {
                out.extend_from_slice(body);
                conn.reader.channel().write_all(&out).await
            }
            None => match conn.reader.channel().write_all(&out).await {
                Ok(()) => relay_body(client, Some(conn.reader.channel()), framing).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = sent {
            if replayable {
                trace!("Session {} write to idle upstream failed: {}", self.id, e);
                return Ok(Relayed::Stale);
            }
            self.send_error(status_for(&e), &e.to_string(), &[], false).await;
            return Err(e);
        }

        let client_keep_alive = head.keep_alive();
        let mut head_sent = false;
        loop {
            let response = match read_response_head(&mut conn.reader).await {
                Ok(response) => response,
                Err(e) if !head_sent && replayable && conn.reader.buffered().is_empty() => {
                    trace!("Session {} idle upstream gave no response: {}", self.id, e);
                    return Ok(Relayed::Stale);
                }
                Err(e) if !head_sent => {
                    self.send_error(StatusCode::BAD_GATEWAY, &e.to_string(), &[], false).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let framing = match response.framing(&head.method) {
                Ok(framing) => framing,
                Err(e) => {
                    if !head_sent {
                        self.send_error(StatusCode::BAD_GATEWAY, &e.to_string(), &[], false).await;
                    }
                    return Err(e);
                }
            };
            trace!("Session {} upstream answered {}", self.id, response.status);

            let close_client = !client_keep_alive || framing == BodyFraming::UntilClose;
            let mut forwarded = ResponseHead {
                version: 1,
                status: response.status,
                reason: response.reason.clone(),
                headers: response.headers.clone(),
            };
            forwarded.headers.remove_hop_by_hop();
            if framing == BodyFraming::Chunked {
                forwarded.headers.add("Transfer-Encoding", "chunked");
            }
            if !response.is_informational() {
                if close_client {
                    forwarded.headers.add("Connection", "close");
                } else if head.version == 0 {
                    forwarded.headers.add("Connection", "keep-alive");
                }
            }

            let mut out = BytesMut::new();
            forwarded.write_to(&mut out);
            self.client.write_all(&out).await?;
            head_sent = true;
            relay_body(&mut conn.reader, Some(&self.client), framing).await?;

            if response.is_informational() {
                continue;
            }
            let reusable = response.keep_alive()
                && framing != BodyFraming::UntilClose
                && conn.reader.buffered().is_empty();
            let exchange = if close_client {
                Exchange::Close
            } else {
                Exchange::KeepAlive
            };
            return Ok(Relayed::Done(exchange, reusable));
        }
    }

    /// Origin host, port and origin-form target of a forwarded request
    fn resolve_target(&self, head: &RequestHead) -> Result<(String, u16, String)> {
        if head.target.starts_with('/') || head.target == "*" {
            if let Some(host) = head.headers.get("Host") {
                let (host, port) = match split_host_port(host) {
                    Some((host, port)) => (host.to_string(), port),
                    None => (unbracket(host).to_string(), 80),
                };
                return Ok((host, port, head.target.clone()));
            }
            if let Some((host, port)) = self.ctx.service.default_upstream() {
                return Ok((host, port, head.target.clone()));
            }
            return Err(Error::invalid_request("request without Host header"));
        }

        let url = Url::parse(&head.target)?;
        if url.scheme() != "http" {
            return Err(Error::invalid_request(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .map(unbracket)
            .ok_or_else(|| Error::invalid_request("absolute URI without host"))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok((host, port, path))
    }

    async fn open_upstream(&self, host: &str, port: u16) -> Result<Channel> {
        match self.ctx.connector.connect(host, port).await {
            Ok(channel) => {
                self.channels.add(&channel)?;
                Ok(channel)
            }
            Err(e) => {
                warn!("Session {} upstream {}:{} unavailable: {}", self.id, host, port, e);
                self.send_error(status_for(&e), &e.to_string(), &[], false).await;
                Err(e)
            }
        }
    }

    /// Best-effort error response; the client may already be gone
    async fn send_error(
        &self,
        status: StatusCode,
        message: &str,
        extra: &[(&str, String)],
        keep_alive: bool,
    ) {
        let response = make_error_response(status, message, extra, keep_alive);
        if let Err(e) = self.client.write_all(&response).await {
            trace!("Session {} could not send {}: {}", self.id, status, e);
        }
    }
}

#[async_trait]
impl ProxySession for HttpProxySession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        debug!("Session {} started for {:?}", self.id, self.client.peer_addr());
        let result = self.run().await;
        self.channels.close_all();
        self.set_state(HttpSessionState::Closed);
        result
    }

    fn stop(&self) {
        self.channels.close_all();
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Status the proxy answers with when `err` ends an exchange
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::InvalidRequest(_) | Error::Protocol(_) | Error::UrlParse(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::UnsupportedVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn read_response_head(reader: &mut ChannelReader) -> Result<ResponseHead> {
    loop {
        if let Some((head, len)) = parse_response_head(reader.buffered())? {
            reader.consume(len);
            return Ok(head);
        }
        if reader.fill().await? == 0 {
            return Err(Error::protocol("upstream closed before responding"));
        }
    }
}

/// Largest request body buffered so it can be resent on a fresh connection
const MAX_REPLAY_BODY: u64 = 64 * 1024;

fn is_replayable(framing: BodyFraming) -> bool {
    match framing {
        BodyFraming::Empty => true,
        BodyFraming::Length(len) => len <= MAX_REPLAY_BODY,
        _ => false,
    }
}

/// Read a whole fixed-length body from `src`
async fn read_body(src: &mut ChannelReader, len: u64) -> Result<BytesMut> {
    let len = len as usize;
    while src.buffered().len() < len {
        if src.fill().await? == 0 {
            return Err(Error::protocol("body ended early"));
        }
    }
    Ok(src.buffer_mut().split_to(len))
}

async fn write_to(dst: Option<&Channel>, data: &[u8]) -> Result<()> {
    match dst {
        Some(channel) if !data.is_empty() => channel.write_all(data).await,
        _ => Ok(()),
    }
}

/// Copy one message body from `src` to `dst` (or discard it) per `framing`
async fn relay_body(
    src: &mut ChannelReader,
    dst: Option<&Channel>,
    framing: BodyFraming,
) -> Result<()> {
    match framing {
        BodyFraming::Empty => Ok(()),
        BodyFraming::Length(mut remaining) => {
            while remaining > 0 {
                if src.buffered().is_empty() && src.fill().await? == 0 {
                    return Err(Error::protocol("body ended early"));
                }
                let take = remaining.min(src.buffered().len() as u64) as usize;
                let piece = src.buffer_mut().split_to(take);
                write_to(dst, &piece).await?;
                remaining -= take as u64;
            }
            Ok(())
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            loop {
                let mut data = BytesMut::new();
                let done = decoder.decode(src.buffer_mut(), &mut data)?;
                let mut out = BytesMut::new();
                encode_chunk(&data, &mut out);
                if done {
                    encode_last_chunk(decoder.trailers(), &mut out);
                }
                write_to(dst, &out).await?;
                if done {
                    return Ok(());
                }
                if src.fill().await? == 0 {
                    return Err(Error::protocol("chunked body ended early"));
                }
            }
        }
        BodyFraming::UntilClose => {
            loop {
                let data = src.take_buffered();
                write_to(dst, &data).await?;
                if src.fill().await? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::protocol::HttpDigest;
    use crate::proxy::sessions::testing::{
        context, pipe_connector, read_http_response, FailingConnector,
    };
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn http_service() -> ServiceConfig {
        ServiceConfig::new("web", ProviderKind::Http, "127.0.0.1", 0)
    }

    fn spawn_session(ctx: SessionContext, client: Channel) -> tokio::task::JoinHandle<Result<()>> {
        let session = Arc::new(HttpProxySession::new(ctx, client));
        tokio::spawn(session.start())
    }

    #[tokio::test]
    async fn test_connect_tunnels_bytes_verbatim() {
        let (connector, mut pipes) = pipe_connector();
        let ctx = context(http_service(), connector.clone());
        let tunnels = ctx.tunnels.clone();
        let (mut client, proxy_side) = duplex(4096);
        let session = spawn_session(ctx, Channel::new(proxy_side, None));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut established = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established[..], CONNECT_ESTABLISHED);

        let (host, port, mut upstream) = pipes.recv().await.unwrap();
        assert_eq!((host.as_str(), port), ("example.com", 443));

        client.write_all(b"\x16\x03\x01 client hello").await.unwrap();
        let mut buf = [0u8; 16];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01 client hello");

        upstream.write_all(b"server hello").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"server hello");
        assert_eq!(tunnels.active(), 1);

        drop(client);
        drop(upstream);
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(tunnels.active(), 0);
    }

    #[tokio::test]
    async fn test_connect_flushes_early_bytes() {
        let (connector, mut pipes) = pipe_connector();
        let (mut client, proxy_side) = duplex(4096);
        let _session = spawn_session(context(http_service(), connector), Channel::new(proxy_side, None));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nearly")
            .await
            .unwrap();
        let (_, _, mut upstream) = pipes.recv().await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_chunked_body_split_across_reads() {
        let (connector, mut pipes) = pipe_connector();
        let mut service = http_service();
        service.default_upstream = Some("origin.local:8080".to_string());

        let client = tokio_test::io::Builder::new()
            .read(b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .read(b"4\r\n")
            .read(b"data\r")
            .read(b"\n0\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .build();
        let session = spawn_session(context(service, connector), Channel::new(client, None));

        let (host, port, mut upstream) = pipes.recv().await.unwrap();
        assert_eq!((host.as_str(), port), ("origin.local", 8080));

        let expected: &[u8] =
            b"GET / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\ndata\r\n0\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], expected);

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_absolute_form_is_rewritten_and_connection_reused() {
        let (connector, mut pipes) = pipe_connector();
        let (mut client, proxy_side) = duplex(4096);
        let _session = spawn_session(
            context(http_service(), connector.clone()),
            Channel::new(proxy_side, None),
        );

        client
            .write_all(
                b"GET http://example.com/a?x=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nX-Trace: 1\r\n\r\n",
            )
            .await
            .unwrap();
        let (host, port, mut upstream) = pipes.recv().await.unwrap();
        assert_eq!((host.as_str(), port), ("example.com", 80));

        let expected: &[u8] = b"GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\nX-Trace: 1\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], expected);

        upstream
            .write_all(b"HTTP/1.1 200 OK\r\nKeep-Alive: timeout=5\r\nContent-Length: 5\r\n\r\nfirst")
            .await
            .unwrap();
        let (head, body) = read_http_response(&mut client).await;
        assert_eq!(head.status, 200);
        assert!(!head.headers.contains("Keep-Alive"));
        assert_eq!(body, b"first");

        // Second request to the same origin goes over the same upstream
        client
            .write_all(b"POST http://example.com/b HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc")
            .await
            .unwrap();
        let expected: &[u8] = b"POST /b HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], expected);

        upstream
            .write_all(b"HTTP/1.1 201 Created\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nsecond\r\n0\r\n\r\n")
            .await
            .unwrap();
        let (head, body) = read_http_response(&mut client).await;
        assert_eq!(head.status, 201);
        assert_eq!(body, b"second");
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_idle_upstream_closed_by_origin_is_replaced() {
        let (connector, mut pipes) = pipe_connector();
        let (mut client, proxy_side) = duplex(4096);
        let _session = spawn_session(
            context(http_service(), connector.clone()),
            Channel::new(proxy_side, None),
        );

        let request: &[u8] = b"POST http://example.com/c HTTP/1.1\r\nContent-Length: 4\r\n\r\nping";
        client.write_all(request).await.unwrap();
        let (_, _, mut first) = pipes.recv().await.unwrap();
        let expected: &[u8] = b"POST /c HTTP/1.1\r\nContent-Length: 4\r\n\r\nping";
        let mut received = vec![0u8; expected.len()];
        first.read_exact(&mut received).await.unwrap();
        first
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none")
            .await
            .unwrap();
        let (head, body) = read_http_response(&mut client).await;
        assert_eq!(head.status, 200);
        assert_eq!(body, b"one");

        // Origin drops the kept-alive connection while it sits idle
        drop(first);

        client.write_all(request).await.unwrap();
        let (_, _, mut second) = pipes.recv().await.unwrap();
        let mut received = vec![0u8; expected.len()];
        second.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], expected);
        second
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo")
            .await
            .unwrap();
        let (head, body) = read_http_response(&mut client).await;
        assert_eq!(head.status, 200);
        assert_eq!(body, b"two");
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_close_delimited_response_closes_client() {
        let (connector, mut pipes) = pipe_connector();
        let (mut client, proxy_side) = duplex(4096);
        let session = spawn_session(context(http_service(), connector), Channel::new(proxy_side, None));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .await
            .unwrap();
        let (_, port, mut upstream) = pipes.recv().await.unwrap();
        assert_eq!(port, 8080);
        let mut head = vec![0u8; b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n".len()];
        upstream.read_exact(&mut head).await.unwrap();

        upstream.write_all(b"HTTP/1.0 200 OK\r\n\r\nstreamed").await.unwrap();
        drop(upstream);

        let mut all = Vec::new();
        client.read_to_end(&mut all).await.unwrap();
        let text = String::from_utf8(all).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nstreamed"));
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_maps_to_status() {
        for (connector, status) in [
            (FailingConnector::refused(), 502),
            (FailingConnector::timed_out(), 504),
        ] {
            let (mut client, proxy_side) = duplex(4096);
            let session = spawn_session(
                context(http_service(), Arc::new(connector)),
                Channel::new(proxy_side, None),
            );

            client
                .write_all(b"CONNECT unreachable.test:443 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
            let (head, body) = read_http_response(&mut client).await;
            assert_eq!(head.status, status);
            assert_eq!(head.headers.get("Connection"), Some("close"));
            assert!(String::from_utf8(body).unwrap().contains(&status.to_string()));
            assert!(session.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn test_malformed_and_unsupported_requests() {
        for (request, status) in [
            (&b"GARBAGE\r\n\r\n"[..], 400),
            (&b"GET / HTTP/2.0\r\n\r\n"[..], 505),
            (&b"GET / HTTP/1.1\r\n\r\n"[..], 400),
            (&b"GET https://example.com/ HTTP/1.1\r\n\r\n"[..], 400),
        ] {
            let (connector, _pipes) = pipe_connector();
            let (mut client, proxy_side) = duplex(4096);
            let session = spawn_session(context(http_service(), connector), Channel::new(proxy_side, None));

            client.write_all(request).await.unwrap();
            let (head, _) = read_http_response(&mut client).await;
            assert_eq!(head.status, status, "{:?}", String::from_utf8_lossy(request));
            assert!(session.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn test_digest_authentication() {
        let (connector, mut pipes) = pipe_connector();
        let mut service = http_service();
        service.username = Some("alice".into());
        service.password = Some("secret".into());
        let (mut client, proxy_side) = duplex(4096);
        let _session = spawn_session(context(service, connector), Channel::new(proxy_side, None));

        client
            .write_all(b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody")
            .await
            .unwrap();
        let (head, _) = read_http_response(&mut client).await;
        assert_eq!(head.status, 407);
        assert_eq!(head.headers.get("Connection"), Some("keep-alive"));
        let challenge = head.headers.get("Proxy-Authenticate").unwrap().to_string();
        assert!(challenge.starts_with("Digest "));
        assert!(challenge.contains("realm=\"trident\""));

        let mut digest = HttpDigest::new("alice", "secret");
        assert!(digest.input(&challenge));
        let authorization = digest.output("GET", "http://example.com/").unwrap();
        client
            .write_all(
                format!(
                    "GET http://example.com/ HTTP/1.1\r\nProxy-Authorization: {}\r\n\r\n",
                    authorization
                )
                .as_bytes(),
            )
            .await
            .unwrap();

        let (_, _, mut upstream) = pipes.recv().await.unwrap();
        let expected: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        let mut received = vec![0u8; expected.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(&received[..], expected);
    }

    #[tokio::test]
    async fn test_stop_cancels_idle_session() {
        let (connector, _pipes) = pipe_connector();
        let (_client, proxy_side) = duplex(4096);
        let session = Arc::new(HttpProxySession::new(
            context(http_service(), connector),
            Channel::new(proxy_side, None),
        ));
        let running = tokio::spawn(session.clone().start());

        tokio::time::sleep(Duration::from_millis(10)).await;
        session.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(e) if e.is_cancelled()));
        assert_eq!(session.state(), HttpSessionState::Closed);
    }
}
