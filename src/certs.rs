use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509Builder, X509};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Error, Result};

/// Certificate and private key presented by a TLS-terminating listener
#[derive(Clone)]
pub struct Certificate {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("fingerprint", &self.fingerprint().unwrap_or_default())
            .finish()
    }
}

impl Certificate {
    /// Load a PEM certificate and its PEM private key
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert = X509::from_pem(&fs::read(cert_path)?).map_err(|e| {
            Error::certificate(format!("{}: {}", cert_path.display(), e))
        })?;
        let key = PKey::private_key_from_pem(&fs::read(key_path)?).map_err(|e| {
            Error::certificate(format!("{}: {}", key_path.display(), e))
        })?;
        if !cert.public_key()?.public_eq(&*key) {
            return Err(Error::certificate(format!(
                "{} does not match {}",
                key_path.display(),
                cert_path.display()
            )));
        }
        Ok(Self { cert, key })
    }

    /// SHA-256 over the DER encoding, lower-case hex
    pub fn fingerprint(&self) -> Result<String> {
        use sha2::{Digest, Sha256};

        let der = self.cert.to_der()?;
        Ok(format!("{:x}", Sha256::digest(&der)))
    }

    /// Host names and addresses the certificate is valid for
    pub fn alt_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(sans) = self.cert.subject_alt_names() {
            for san in sans.iter() {
                if let Some(dns) = san.dnsname() {
                    names.push(dns.to_string());
                } else if let Some(ip) = san.ipaddress() {
                    let addr = match ip.len() {
                        4 => <[u8; 4]>::try_from(ip).ok().map(IpAddr::from),
                        16 => <[u8; 16]>::try_from(ip).ok().map(IpAddr::from),
                        _ => None,
                    };
                    names.extend(addr.map(|a| a.to_string()));
                }
            }
        }
        names
    }
}

/// Source of listener certificates: self-signed per host name, persisted
/// under a directory and cached in memory
pub struct CertificateStore {
    cert_dir: PathBuf,
    cert_cache: Arc<RwLock<HashMap<String, Certificate>>>,
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cert_dir", &self.cert_dir)
            .finish()
    }
}

impl CertificateStore {
    pub fn new<P: AsRef<Path>>(cert_dir: P) -> Result<Self> {
        let cert_dir = cert_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cert_dir)?;

        Ok(Self {
            cert_dir,
            cert_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Certificate for `hostname`, generated on first use
    pub async fn get_cert_for_host(&self, hostname: &str) -> Result<Certificate> {
        {
            let cache = self.cert_cache.read().await;
            if let Some(cert) = cache.get(hostname) {
                return Ok(cert.clone());
            }
        }

        let mut cache = self.cert_cache.write().await;
        // Another task may have filled it while we waited
        if let Some(cert) = cache.get(hostname) {
            return Ok(cert.clone());
        }

        let (cert_path, key_path) = self.paths_for(hostname);
        let cert = if cert_path.exists() && key_path.exists() {
            debug!("Loading certificate for {} from {}", hostname, cert_path.display());
            Certificate::from_pem_files(&cert_path, &key_path)?
        } else {
            debug!("Generating self-signed certificate for {}", hostname);
            let cert = generate_self_signed(hostname)?;
            fs::write(&cert_path, cert.cert.to_pem()?)?;
            fs::write(&key_path, cert.key.private_key_to_pem_pkcs8()?)?;
            cert
        };

        cache.insert(hostname.to_string(), cert.clone());
        Ok(cert)
    }

    fn paths_for(&self, hostname: &str) -> (PathBuf, PathBuf) {
        let stem: String = hostname
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        (
            self.cert_dir.join(format!("{}-cert.pem", stem)),
            self.cert_dir.join(format!("{}-key.pem", stem)),
        )
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cert_cache.write().await;
        cache.clear();
    }

    pub async fn cache_size(&self) -> usize {
        let cache = self.cert_cache.read().await;
        cache.len()
    }
}

/// Self-signed leaf certificate valid for `hostname` for one year
pub fn generate_self_signed(hostname: &str) -> Result<Certificate> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut cert_builder = X509Builder::new()?;
    cert_builder.set_version(2)?;

    let serial_number = {
        let mut serial = BigNum::new()?;
        serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    cert_builder.set_serial_number(&serial_number)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    cert_builder.set_not_before(&not_before)?;
    cert_builder.set_not_after(&not_after)?;

    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_nid(Nid::COMMONNAME, hostname)?;
    name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, "trident")?;
    let name = name_builder.build();
    cert_builder.set_subject_name(&name)?;
    cert_builder.set_issuer_name(&name)?;

    cert_builder.set_pubkey(&key)?;

    // No key usage extension: the certificate must also verify as its own issuer
    cert_builder.append_extension(BasicConstraints::new().build()?)?;
    cert_builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&cert_builder.x509v3_context(None, None))?;
    cert_builder.append_extension(subject_key_identifier)?;

    let mut san_builder = SubjectAlternativeName::new();
    if hostname.parse::<IpAddr>().is_ok() {
        san_builder.ip(hostname);
    } else {
        san_builder.dns(hostname);
    }
    let san = san_builder.build(&cert_builder.x509v3_context(None, None))?;
    cert_builder.append_extension(san)?;

    cert_builder.sign(&key, MessageDigest::sha256())?;

    Ok(Certificate {
        cert: cert_builder.build(),
        key,
    })
}
