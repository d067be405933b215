pub mod certs;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod tls;

pub use channel::{Channel, Datagram, DatagramChannel};
pub use error::{Error, Result};
pub use proxy::{ProxyServer, TunnelingService};
pub use server::TridentServer;
