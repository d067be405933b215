use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay buffer size per tunnel direction
    pub buffer_size: usize,
    pub connect_timeout_secs: u64,
    /// Skip upstream certificate verification
    pub ssl_insecure: bool,
    pub cert_store_path: String,
    pub udp_idle_timeout_secs: u64,
    pub nonce_lifetime_secs: u64,
    pub services: Vec<ServiceConfig>,
}

/// Session type a service hands its clients to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Http,
    Socks,
    Scissors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
    /// TCP with TLS terminated at the listener
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub provider: ProviderKind,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub port: u16,
    #[serde(default)]
    pub transport: Transport,

    // http
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_realm")]
    pub realm: String,
    /// `host:port` used for origin-form requests that carry no Host header
    #[serde(default)]
    pub default_upstream: Option<String>,

    // scissors
    #[serde(default)]
    pub remote_address: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub remote_ssl: bool,

    // tls transport
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    // socks; empty admits every user id
    #[serde(default)]
    pub allowed_user_ids: Vec<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_realm() -> String {
    "trident".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            connect_timeout_secs: 10,
            ssl_insecure: false,
            cert_store_path: "~/.trident/certs".to_string(),
            udp_idle_timeout_secs: 60,
            nonce_lifetime_secs: 300,
            services: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn new(
        name: impl Into<String>,
        provider: ProviderKind,
        bind_address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            bind_address: bind_address.into(),
            port,
            transport: Transport::Tcp,
            username: None,
            password: None,
            realm: default_realm(),
            default_upstream: None,
            remote_address: None,
            remote_port: None,
            remote_ssl: false,
            cert_path: None,
            key_path: None,
            allowed_user_ids: Vec::new(),
        }
    }

    /// Service from a command-line `ADDR:PORT` value
    pub fn from_listen_arg(name: &str, provider: ProviderKind, listen: &str) -> Result<Self> {
        let (host, port) = split_host_port(listen)
            .ok_or_else(|| Error::invalid_config(format!("expected ADDR:PORT, got {}", listen)))?;
        Ok(Self::new(name, provider, host, port))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Digest credentials, when authentication is enabled
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }

    /// Fixed destination of a scissors service
    pub fn remote(&self) -> Option<(&str, u16)> {
        match (&self.remote_address, self.remote_port) {
            (Some(host), Some(port)) => Some((host, port)),
            _ => None,
        }
    }

    pub fn default_upstream(&self) -> Option<(String, u16)> {
        self.default_upstream
            .as_deref()
            .and_then(split_host_port)
            .map(|(host, port)| (host.to_string(), port))
    }

    pub fn user_id_allowed(&self, user_id: &str) -> bool {
        self.allowed_user_ids.is_empty() || self.allowed_user_ids.iter().any(|u| u == user_id)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::invalid_config(format!("service {}: {}", self.name, msg)));

        if self.name.is_empty() {
            return Err(Error::invalid_config("service without a name"));
        }
        if self.username.is_some() != self.password.is_some() {
            return invalid("username and password must be set together");
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return invalid("cert_path and key_path must be set together");
        }
        if let Some(upstream) = &self.default_upstream {
            if split_host_port(upstream).is_none() {
                return invalid("default_upstream must be HOST:PORT");
            }
        }
        match self.provider {
            ProviderKind::Scissors => {
                if self.remote().is_none() {
                    return invalid("scissors requires remote_address and remote_port");
                }
                if self.transport == Transport::Udp && self.remote_ssl {
                    return invalid("remote_ssl is not available over udp");
                }
            }
            ProviderKind::Http | ProviderKind::Socks => {
                if self.transport == Transport::Udp {
                    return invalid("udp transport is only available for scissors");
                }
            }
        }
        Ok(())
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals
pub fn split_host_port(value: &str) -> Option<(&str, u16)> {
    let (host, port) = value.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Expand a leading `~` to the user's home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(path)
}

impl Config {
    /// Load from any file format the `config` crate understands
    ///
    /// `TRIDENT_*` environment variables override top-level settings.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("TRIDENT"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("buffer_size must be positive"));
        }
        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(Error::invalid_config(format!(
                    "duplicate service name {}",
                    service.name
                )));
            }
            service.validate()?;
        }
        Ok(())
    }

    pub fn cert_store_path(&self) -> PathBuf {
        expand_path(&self.cert_store_path)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}
