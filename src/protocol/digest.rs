//! HTTP Digest authentication (RFC 2617, with the RFC 7616 SHA-256 variants)
//!
//! [`HttpDigest`] answers challenges on behalf of a credential holder;
//! [`DigestAuthenticator`] issues challenges and checks the answers.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hash algorithm named in a Digest challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "MD5-SESS" => Some(Self::Md5Sess),
            "SHA-256" => Some(Self::Sha256),
            "SHA-256-SESS" => Some(Self::Sha256Sess),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Md5Sess => "MD5-sess",
            Self::Sha256 => "SHA-256",
            Self::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, Self::Md5Sess | Self::Sha256Sess)
    }

    fn hash(&self, data: &str) -> String {
        match self {
            Self::Md5 | Self::Md5Sess => format!("{:x}", Md5::digest(data.as_bytes())),
            Self::Sha256 | Self::Sha256Sess => format!("{:x}", Sha256::digest(data.as_bytes())),
        }
    }
}

struct ResponseInputs<'a> {
    algorithm: DigestAlgorithm,
    username: &'a str,
    password: &'a str,
    realm: &'a str,
    nonce: &'a str,
    cnonce: &'a str,
    nc: &'a str,
    qop: Option<&'a str>,
    method: &'a str,
    uri: &'a str,
}

fn compute_response(i: &ResponseInputs<'_>) -> String {
    let mut ha1 = i
        .algorithm
        .hash(&format!("{}:{}:{}", i.username, i.realm, i.password));
    if i.algorithm.is_session() {
        ha1 = i.algorithm.hash(&format!("{}:{}:{}", ha1, i.nonce, i.cnonce));
    }
    let ha2 = i.algorithm.hash(&format!("{}:{}", i.method, i.uri));

    match i.qop {
        Some(qop) => i.algorithm.hash(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, i.nonce, i.nc, i.cnonce, qop, ha2
        )),
        None => i.algorithm.hash(&format!("{}:{}:{}", ha1, i.nonce, ha2)),
    }
}

/// Split `Digest k=v, ...` into its parameters; names are lower-cased
///
/// Returns `None` when the scheme is not Digest or the list is malformed.
pub fn parse_digest_params(header: &str) -> Option<HashMap<String, String>> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            name.push(c);
            chars.next();
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.next() != Some('=') || name.is_empty() {
            return None;
        }
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.push(chars.next()?),
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return None;
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' || c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        params.insert(name.to_ascii_lowercase(), value);
    }
    Some(params)
}

fn fresh_cnonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[derive(Debug, Clone, Default)]
struct Challenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    algorithm: Option<DigestAlgorithm>,
}

/// Digest credential holder answering server challenges
#[derive(Debug, Clone)]
pub struct HttpDigest {
    username: String,
    password: String,
    challenge: Option<Challenge>,
    cnonce: String,
    stale: bool,
    nonce_count: u32,
}

impl HttpDigest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            challenge: None,
            cnonce: String::new(),
            stale: false,
            nonce_count: 0,
        }
    }

    /// Take a `Proxy-Authenticate` / `WWW-Authenticate` challenge value
    ///
    /// Resets the nonce counter. Returns false, leaving the previous state in
    /// place, when the value is not a usable Digest challenge.
    pub fn input(&mut self, challenge: &str) -> bool {
        let params = match parse_digest_params(challenge) {
            Some(params) => params,
            None => return false,
        };
        let (realm, nonce) = match (params.get("realm"), params.get("nonce")) {
            (Some(realm), Some(nonce)) if !nonce.is_empty() => (realm.clone(), nonce.clone()),
            _ => return false,
        };
        let algorithm = match params.get("algorithm") {
            Some(name) => match DigestAlgorithm::parse(name) {
                Some(algorithm) => Some(algorithm),
                None => return false,
            },
            None => None,
        };
        let qop = match params.get("qop") {
            Some(offered) => {
                if !offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    return false;
                }
                Some("auth".to_string())
            }
            None => None,
        };

        self.stale = params
            .get("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        self.challenge = Some(Challenge {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            qop,
            algorithm,
        });
        self.nonce_count = 0;
        true
    }

    /// Build the authorization value for `method` and `path`
    ///
    /// Every call uses a fresh client nonce and the next nonce count, so two
    /// calls never produce the same answer. `None` until a challenge was input.
    pub fn output(&mut self, method: &str, path: &str) -> Option<String> {
        let challenge = self.challenge.as_ref()?;
        self.nonce_count += 1;
        self.cnonce = fresh_cnonce();
        let nc = format!("{:08x}", self.nonce_count);
        let algorithm = challenge.algorithm.unwrap_or(DigestAlgorithm::Md5);

        let response = compute_response(&ResponseInputs {
            algorithm,
            username: &self.username,
            password: &self.password,
            realm: &challenge.realm,
            nonce: &challenge.nonce,
            cnonce: &self.cnonce,
            nc: &nc,
            qop: challenge.qop.as_deref(),
            method,
            uri: path,
        });

        let mut value = format!(
            "Digest username={}, realm={}, nonce={}, uri={}, algorithm={}, response={}",
            quote(&self.username),
            quote(&challenge.realm),
            quote(&challenge.nonce),
            quote(path),
            algorithm.as_str(),
            quote(&response)
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(", opaque={}", quote(opaque)));
        }
        if let Some(qop) = &challenge.qop {
            value.push_str(&format!(", qop={}, nc={}, cnonce={}", qop, nc, quote(&self.cnonce)));
        }
        Some(value)
    }

    /// Forget the current challenge and counter
    pub fn reset(&mut self) {
        self.challenge = None;
        self.cnonce.clear();
        self.stale = false;
        self.nonce_count = 0;
    }

    /// Whether the last challenge flagged the previous nonce as stale
    ///
    /// The credentials were accepted but must be re-sent against the new nonce.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn nonce_count(&self) -> u32 {
        self.nonce_count
    }

    pub fn realm(&self) -> Option<&str> {
        self.challenge.as_ref().map(|c| c.realm.as_str())
    }

    pub fn nonce(&self) -> Option<&str> {
        self.challenge.as_ref().map(|c| c.nonce.as_str())
    }
}

/// Result of checking a client's `Proxy-Authorization`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    /// Answer with a fresh challenge; `stale` when only the nonce was at fault
    Challenge { stale: bool },
}

/// Server side of Digest authentication for one proxy service
#[derive(Debug)]
pub struct DigestAuthenticator {
    username: String,
    password: String,
    realm: String,
    opaque: String,
    secret: String,
    nonce_lifetime: i64,
    // nonce -> (issued at, highest nonce count seen)
    seen: Mutex<HashMap<String, (i64, u32)>>,
}

impl DigestAuthenticator {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        realm: impl Into<String>,
        nonce_lifetime_secs: u64,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
            opaque: uuid::Uuid::new_v4().simple().to_string(),
            secret: uuid::Uuid::new_v4().simple().to_string(),
            nonce_lifetime: nonce_lifetime_secs.min(i64::MAX as u64) as i64,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn sign(&self, issued: i64) -> String {
        format!("{:x}", Sha256::digest(format!("{}:{}", issued, self.secret).as_bytes()))
    }

    fn make_nonce(&self, issued: i64) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", issued, self.sign(issued)))
    }

    /// Issue time of a nonce this authenticator minted
    fn nonce_issued_at(&self, nonce: &str) -> Option<i64> {
        let decoded = URL_SAFE_NO_PAD.decode(nonce).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (issued, signature) = decoded.split_once(':')?;
        let issued: i64 = issued.parse().ok()?;
        (self.sign(issued) == signature).then_some(issued)
    }

    /// `Proxy-Authenticate` value carrying a freshly minted nonce
    pub fn challenge(&self, stale: bool) -> String {
        let nonce = self.make_nonce(chrono::Utc::now().timestamp());
        let mut value = format!(
            "Digest realm={}, nonce={}, opaque={}, qop=\"auth\", algorithm=MD5",
            quote(&self.realm),
            quote(&nonce),
            quote(&self.opaque)
        );
        if stale {
            value.push_str(", stale=true");
        }
        value
    }

    /// Check the `Proxy-Authorization` value of a `method` request for `target`
    pub fn verify(&self, method: &str, target: &str, authorization: Option<&str>) -> AuthOutcome {
        let rejected = AuthOutcome::Challenge { stale: false };
        let params = match authorization.and_then(parse_digest_params) {
            Some(params) => params,
            None => return rejected,
        };
        let field = |name: &str| params.get(name).map(String::as_str).unwrap_or("");

        if field("username") != self.username || field("realm") != self.realm {
            return rejected;
        }
        if field("uri") != target {
            return rejected;
        }
        let algorithm = match params.get("algorithm") {
            Some(name) => match DigestAlgorithm::parse(name) {
                Some(algorithm) => algorithm,
                None => return rejected,
            },
            None => DigestAlgorithm::Md5,
        };
        let qop = params.get("qop").map(String::as_str);
        if qop.is_some_and(|q| !q.eq_ignore_ascii_case("auth")) {
            return rejected;
        }

        let nonce = field("nonce");
        let issued = match self.nonce_issued_at(nonce) {
            Some(issued) => issued,
            None => return rejected,
        };

        let expected = compute_response(&ResponseInputs {
            algorithm,
            username: &self.username,
            password: &self.password,
            realm: &self.realm,
            nonce,
            cnonce: field("cnonce"),
            nc: field("nc"),
            qop,
            method,
            uri: target,
        });
        if !expected.eq_ignore_ascii_case(field("response")) {
            return rejected;
        }

        let now = chrono::Utc::now().timestamp();
        if now - issued > self.nonce_lifetime {
            return AuthOutcome::Challenge { stale: true };
        }

        let nc = if qop.is_some() {
            match u32::from_str_radix(field("nc"), 16) {
                Ok(nc) => nc,
                Err(_) => return rejected,
            }
        } else {
            0
        };

        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lifetime = self.nonce_lifetime;
        seen.retain(|_, (issued_at, _)| now - *issued_at <= lifetime);
        let entry = seen.entry(nonce.to_string()).or_insert((issued, 0));
        if qop.is_some() && nc <= entry.1 {
            // Replayed nonce count
            return AuthOutcome::Challenge { stale: true };
        }
        entry.1 = nc;
        AuthOutcome::Authorized
    }
}
