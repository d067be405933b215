//! Doubles shared by the session tests

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::config::{Config, ServiceConfig};
use crate::protocol::{parse_response_head, BodyFraming, ChunkedDecoder, ResponseHead};
use crate::proxy::session::{Connector, SessionContext};
use crate::proxy::tunnel::TunnelingService;
use crate::tls::OpensslProvider;
use crate::{Error, Result};

pub(crate) type Pipe = (String, u16, DuplexStream);

/// Connector whose upstreams are in-memory pipes handed to the test
#[derive(Debug)]
pub(crate) struct PipeConnector {
    pipes: mpsc::UnboundedSender<Pipe>,
    connects: AtomicUsize,
}

impl PipeConnector {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub(crate) fn pipe_connector() -> (Arc<PipeConnector>, mpsc::UnboundedReceiver<Pipe>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = PipeConnector {
        pipes: tx,
        connects: AtomicUsize::new(0),
    };
    (Arc::new(connector), rx)
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Channel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = duplex(64 * 1024);
        self.pipes
            .send((host.to_string(), port, theirs))
            .map_err(|_| Error::internal("test dropped the pipe receiver"))?;
        Ok(Channel::new(ours, None))
    }
}

#[derive(Debug)]
pub(crate) struct FailingConnector {
    timeout: bool,
}

impl FailingConnector {
    pub(crate) fn refused() -> Self {
        Self { timeout: false }
    }

    pub(crate) fn timed_out() -> Self {
        Self { timeout: true }
    }
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Channel> {
        let target = format!("{}:{}", host, port);
        if self.timeout {
            Err(Error::ConnectTimeout(target))
        } else {
            Err(Error::ConnectFailed(
                target,
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ))
        }
    }
}

pub(crate) fn context(service: ServiceConfig, connector: Arc<dyn Connector>) -> SessionContext {
    let config = Config::default();
    SessionContext::new(
        service,
        &config,
        TunnelingService::init(1024),
        connector,
        Arc::new(OpensslProvider::new(true).unwrap()),
    )
}

/// Read one response and its decoded body
pub(crate) async fn read_http_response<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> (ResponseHead, Vec<u8>) {
    let mut buf = BytesMut::new();
    let head = loop {
        if let Some((head, len)) = parse_response_head(&buf).unwrap() {
            let _ = buf.split_to(len);
            break head;
        }
        assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "eof before response head");
    };

    let mut body = BytesMut::new();
    match head.framing("GET").unwrap() {
        BodyFraming::Empty => {}
        BodyFraming::Length(len) => {
            while (buf.len() as u64) < len {
                assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "eof in body");
            }
            body = buf.split_to(len as usize);
        }
        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            while !decoder.decode(&mut buf, &mut body).unwrap() {
                assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "eof in chunked body");
            }
        }
        BodyFraming::UntilClose => {
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            body = buf;
            body.extend_from_slice(&rest);
        }
    }
    (head, body.to_vec())
}
