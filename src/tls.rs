//! TLS on top of [`Channel`]s
//!
//! The handshake itself is opaque to the sessions: they hand a plain channel
//! to a [`SecureChannelProvider`] and get an encrypted one back.

use async_trait::async_trait;
use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::pin::Pin;
use tokio_openssl::SslStream;
use tracing::debug;

use crate::certs::Certificate;
use crate::channel::Channel;
use crate::{Error, Result};

#[async_trait]
pub trait SecureChannelProvider: Send + Sync + std::fmt::Debug {
    /// Run a client handshake over `channel`, verifying `server_name`
    async fn wrap_client(&self, channel: Channel, server_name: &str) -> Result<Channel>;

    /// Run a server handshake over `channel`, presenting `certificate`
    async fn wrap_server(&self, channel: Channel, certificate: &Certificate) -> Result<Channel>;
}

/// Provider backed by OpenSSL
pub struct OpensslProvider {
    connector: SslConnector,
    insecure: bool,
}

impl std::fmt::Debug for OpensslProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpensslProvider")
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl OpensslProvider {
    /// Verify upstream certificates against the system roots unless `insecure`
    pub fn new(insecure: bool) -> Result<Self> {
        Self::with_roots(insecure, &[])
    }

    /// Like [`new`](Self::new), additionally trusting `roots`
    pub fn with_roots(insecure: bool, roots: &[X509]) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;
        for root in roots {
            builder.cert_store_mut().add_cert(root.clone())?;
        }
        if insecure {
            builder.set_verify(SslVerifyMode::NONE);
        }
        Ok(Self {
            connector: builder.build(),
            insecure,
        })
    }
}

#[async_trait]
impl SecureChannelProvider for OpensslProvider {
    async fn wrap_client(&self, channel: Channel, server_name: &str) -> Result<Channel> {
        let peer = channel.peer_addr();
        let stream = channel.into_stream()?;

        let mut config = self.connector.configure()?;
        if self.insecure {
            config.set_verify_hostname(false);
        }
        let ssl = config.into_ssl(server_name)?;
        let mut tls = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls)
            .connect()
            .await
            .map_err(|e| Error::TlsHandshake(format!("{}: {}", server_name, e)))?;

        debug!("TLS client handshake with {} complete", server_name);
        Ok(Channel::new(tls, peer))
    }

    async fn wrap_server(&self, channel: Channel, certificate: &Certificate) -> Result<Channel> {
        let peer = channel.peer_addr();
        let stream = channel.into_stream()?;

        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor.set_private_key(&certificate.key)?;
        acceptor.set_certificate(&certificate.cert)?;
        acceptor.check_private_key()?;
        let acceptor = acceptor.build();

        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls).accept().await.map_err(|e| {
            Error::TlsHandshake(format!("{}: {}", peer.map(|p| p.to_string()).unwrap_or_default(), e))
        })?;

        debug!("TLS server handshake with {:?} complete", peer);
        Ok(Channel::new(tls, peer))
    }
}
