//! Session types, one per provider kind

pub mod http;
pub mod scissors;
pub mod socks;

#[cfg(test)]
pub(crate) mod testing;

pub use self::http::{HttpProxySession, HttpSessionState};
pub use scissors::{ScissorsSession, ScissorsState, UdpScissorsSession};
pub use socks::{SocksProxySession, SocksSessionState};
