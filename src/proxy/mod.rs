//! Proxy services: listeners, sessions and the relay engine they share
//!
//! A [`ProxyServer`] accepts clients for one configured service and hands
//! each to a session of the service's provider kind. Sessions that end up
//! forwarding raw bytes bind their two channels into the process-wide
//! [`TunnelingService`].

pub mod registry;
pub mod server;
pub mod session;
pub mod sessions;
pub mod tunnel;

pub use registry::{EntryId, Registry};
pub use server::ProxyServer;
pub use session::{ChannelReader, ChannelSet, Connector, ProxySession, SessionContext, TcpConnector};
pub use sessions::{HttpProxySession, ScissorsSession, SocksProxySession, UdpScissorsSession};
pub use tunnel::{TunnelHandle, TunnelState, TunnelingService};
