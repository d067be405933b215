use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Connection to {0} failed: {1}")]
    ConnectFailed(String, std::io::Error),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("A {0} operation is already outstanding")]
    OperationPending(&'static str),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn certificate<T: fmt::Display>(msg: T) -> Self {
        Error::Certificate(msg.to_string())
    }

    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Error::Auth(msg.to_string())
    }

    pub fn invalid_request<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidRequest(msg.to_string())
    }

    pub fn protocol<T: fmt::Display>(msg: T) -> Self {
        Error::Protocol(msg.to_string())
    }

    pub fn invalid_config<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidConfig(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        Error::Internal(msg.to_string())
    }

    /// Whether this error ended an I/O operation because its channel was closed
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::ChannelClosed)
    }

    /// Transport-level failures: they end a session or tunnel half, never the service
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Cancelled
                | Error::ChannelClosed
                | Error::OperationPending(_)
                | Error::ConnectFailed(..)
                | Error::ConnectTimeout(_)
                | Error::Tls(_)
                | Error::TlsHandshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::ChannelClosed.is_cancelled());
        assert!(!Error::ShuttingDown.is_cancelled());

        assert!(Error::ConnectTimeout("example.com:80".into()).is_transport());
        assert!(!Error::protocol("bad chunk").is_transport());
        assert!(!Error::auth("stale nonce").is_transport());
    }

    #[test]
    fn test_error_display() {
        let err = Error::OperationPending("read");
        assert_eq!(err.to_string(), "A read operation is already outstanding");
    }
}
