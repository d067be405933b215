use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use crate::certs::CertificateStore;
use crate::config::{Config, Transport};
use crate::proxy::{Connector, ProxyServer, SessionContext, TcpConnector, TunnelingService};
use crate::tls::{OpensslProvider, SecureChannelProvider};
use crate::Result;

/// Every configured service of one process plus the relay engine they share
pub struct TridentServer {
    tunnels: TunnelingService,
    proxies: Vec<Arc<ProxyServer>>,
}

impl TridentServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let tunnels = TunnelingService::init(config.buffer_size);
        let tls: Arc<dyn SecureChannelProvider> =
            Arc::new(OpensslProvider::new(config.ssl_insecure)?);
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.connect_timeout()));

        let needs_store = config
            .services
            .iter()
            .any(|s| s.transport == Transport::Tls && s.cert_path.is_none());
        let certs = if needs_store {
            Some(Arc::new(CertificateStore::new(config.cert_store_path())?))
        } else {
            None
        };

        let proxies = config
            .services
            .iter()
            .map(|service| {
                let ctx = SessionContext::new(
                    service.clone(),
                    &config,
                    tunnels.clone(),
                    connector.clone(),
                    tls.clone(),
                );
                let proxy = match &certs {
                    Some(store) => ProxyServer::new(ctx).with_certificates(store.clone()),
                    None => ProxyServer::new(ctx),
                };
                Arc::new(proxy)
            })
            .collect();

        Ok(Self { tunnels, proxies })
    }

    pub fn tunnels(&self) -> &TunnelingService {
        &self.tunnels
    }

    pub fn proxies(&self) -> &[Arc<ProxyServer>] {
        &self.proxies
    }

    /// Bind every service; any bind failure is fatal
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let mut addrs = Vec::with_capacity(self.proxies.len());
        for proxy in &self.proxies {
            addrs.push(proxy.start().await?);
        }
        Ok(addrs)
    }

    /// Stop all services, then wait for the remaining relays to drain
    pub async fn shutdown(&self) {
        for proxy in &self.proxies {
            proxy.stop().await;
        }
        self.tunnels.term().await;
        info!("All services stopped");
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting {} service(s)", self.proxies.len());
        self.start().await?;

        signal::ctrl_c().await?;
        info!("Received shutdown signal");
        self.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, ServiceConfig};

    #[tokio::test]
    async fn test_server_lifecycle() {
        let mut config = Config::default();
        config
            .services
            .push(ServiceConfig::new("web", ProviderKind::Http, "127.0.0.1", 0));
        config
            .services
            .push(ServiceConfig::new("socks", ProviderKind::Socks, "127.0.0.1", 0));

        let server = TridentServer::new(config).unwrap();
        let addrs = server.start().await.unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a.port() != 0));

        server.shutdown().await;
        assert_eq!(server.tunnels().active(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config
            .services
            .push(ServiceConfig::new("relay", ProviderKind::Scissors, "127.0.0.1", 0));
        assert!(TridentServer::new(config).is_err());
    }
}
