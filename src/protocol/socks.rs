//! SOCKS4 / SOCKS4a wire records
//!
//! Requests are decoded with [`Socks4Codec`] as bytes arrive; replies are the
//! fixed 8-byte record. The UDP relay envelope is the one used by SOCKS UDP
//! associate, limited to IPv4 addresses.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const REPLY_VERSION: u8 = 0x00;
pub const REQUEST_GRANTED: u8 = 0x5A;
pub const REQUEST_FAILED: u8 = 0x5B;

/// VER CMD PORT(2) ADDR(4)
const FIXED_LEN: usize = 8;
/// Upper bound for the user id and the SOCKS4a host name, each
const MAX_FIELD_LEN: usize = 255;

const ATYP_IPV4: u8 = 0x01;
const UDP_HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
    UdpAssociate,
    Unknown(u8),
}

impl From<u8> for SocksCommand {
    fn from(code: u8) -> Self {
        match code {
            0x01 => SocksCommand::Connect,
            0x02 => SocksCommand::Bind,
            0x03 => SocksCommand::UdpAssociate,
            other => SocksCommand::Unknown(other),
        }
    }
}

/// Destination named by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksTarget {
    Ip(SocketAddrV4),
    /// SOCKS4a: resolved by the proxy
    Domain(String, u16),
}

impl SocksTarget {
    pub fn host(&self) -> String {
        match self {
            SocksTarget::Ip(addr) => addr.ip().to_string(),
            SocksTarget::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksTarget::Ip(addr) => addr.port(),
            SocksTarget::Domain(_, port) => *port,
        }
    }
}

impl std::fmt::Display for SocksTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksTarget::Ip(addr) => write!(f, "{}", addr),
            SocksTarget::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: SocksCommand,
    pub target: SocksTarget,
    pub user_id: String,
}

/// Reply record: `0x00 code port addr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksReply {
    pub granted: bool,
    pub addr: SocketAddrV4,
}

impl SocksReply {
    pub fn granted(addr: SocketAddrV4) -> Self {
        Self { granted: true, addr }
    }

    pub fn failed() -> Self {
        Self {
            granted: false,
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Socks4Codec;

impl Socks4Codec {
    pub fn new() -> Self {
        Self
    }
}

fn nul_terminated(buf: &[u8]) -> Result<Option<(String, usize)>> {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) if pos > MAX_FIELD_LEN => Err(Error::protocol("SOCKS field too long")),
        Some(pos) => Ok(Some((String::from_utf8_lossy(&buf[..pos]).into_owned(), pos + 1))),
        None if buf.len() > MAX_FIELD_LEN => Err(Error::protocol("SOCKS field too long")),
        None => Ok(None),
    }
}

impl Decoder for Socks4Codec {
    type Item = SocksRequest;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SocksRequest>> {
        // The version byte is judged on its own, before the rest arrives
        match src.first() {
            None => return Ok(None),
            Some(&SOCKS4_VERSION) => {}
            Some(&other) => {
                return Err(Error::protocol(format!("unsupported SOCKS version {}", other)));
            }
        }
        if src.len() < FIXED_LEN {
            return Ok(None);
        }

        let command = SocksCommand::from(src[1]);
        let port = u16::from_be_bytes([src[2], src[3]]);
        let ip = Ipv4Addr::new(src[4], src[5], src[6], src[7]);

        let (user_id, user_len) = match nul_terminated(&src[FIXED_LEN..])? {
            Some(field) => field,
            None => return Ok(None),
        };
        let mut consumed = FIXED_LEN + user_len;

        let octets = ip.octets();
        let target = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
            let (host, host_len) = match nul_terminated(&src[consumed..])? {
                Some(field) => field,
                None => return Ok(None),
            };
            if host.is_empty() {
                return Err(Error::protocol("empty SOCKS4a host name"));
            }
            consumed += host_len;
            SocksTarget::Domain(host, port)
        } else {
            SocksTarget::Ip(SocketAddrV4::new(ip, port))
        };

        src.advance(consumed);
        Ok(Some(SocksRequest {
            command,
            target,
            user_id,
        }))
    }
}

impl Encoder<SocksReply> for Socks4Codec {
    type Error = Error;

    fn encode(&mut self, reply: SocksReply, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(FIXED_LEN);
        dst.put_u8(REPLY_VERSION);
        dst.put_u8(if reply.granted {
            REQUEST_GRANTED
        } else {
            REQUEST_FAILED
        });
        dst.put_u16(reply.addr.port());
        dst.put_slice(&reply.addr.ip().octets());
        Ok(())
    }
}

/// Split a client datagram into its destination and payload
///
/// Fragments are not reassembled: `Ok(None)` tells the caller to drop it.
pub fn decode_udp_envelope(datagram: &[u8]) -> Result<Option<(SocketAddrV4, &[u8])>> {
    if datagram.len() < UDP_HEADER_LEN {
        return Err(Error::protocol("truncated UDP relay header"));
    }
    if datagram[2] != 0 {
        return Ok(None);
    }
    if datagram[3] != ATYP_IPV4 {
        return Err(Error::protocol(format!(
            "unsupported UDP relay address type {}",
            datagram[3]
        )));
    }
    let ip = Ipv4Addr::new(datagram[4], datagram[5], datagram[6], datagram[7]);
    let port = u16::from_be_bytes([datagram[8], datagram[9]]);
    Ok(Some((SocketAddrV4::new(ip, port), &datagram[UDP_HEADER_LEN..])))
}

/// Wrap a payload received from `peer` for delivery to the client
pub fn encode_udp_envelope(peer: SocketAddrV4, payload: &[u8], out: &mut BytesMut) {
    out.reserve(UDP_HEADER_LEN + payload.len());
    out.put_u16(0);
    out.put_u8(0);
    out.put_u8(ATYP_IPV4);
    out.put_slice(&peer.ip().octets());
    out.put_u16(peer.port());
    out.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connect_byte_by_byte() {
        let raw = b"\x04\x01\x00\x50\x5d\xb8\xd8\x22alice\x00";
        let mut codec = Socks4Codec::new();
        let mut buf = BytesMut::new();

        for (i, byte) in raw.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < raw.len() {
                assert!(decoded.is_none(), "decoded early at byte {}", i);
            } else {
                let request = decoded.unwrap();
                assert_eq!(request.command, SocksCommand::Connect);
                assert_eq!(
                    request.target,
                    SocksTarget::Ip("93.184.216.34:80".parse().unwrap())
                );
                assert_eq!(request.user_id, "alice");
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_socks4a_leaves_payload() {
        let mut buf = BytesMut::from(&b"\x04\x01\x01\xbb\x00\x00\x00\x01\x00example.com\x00hello"[..]);
        let request = Socks4Codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(request.target, SocksTarget::Domain("example.com".into(), 443));
        assert_eq!(request.target.to_string(), "example.com:443");
        assert_eq!(request.user_id, "");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_decode_rejects_bad_version_immediately() {
        let mut buf = BytesMut::from(&b"\x05"[..]);
        assert!(Socks4Codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_other_commands() {
        let mut buf = BytesMut::from(&b"\x04\x02\x00\x50\x7f\x00\x00\x01\x00"[..]);
        assert_eq!(Socks4Codec.decode(&mut buf).unwrap().unwrap().command, SocksCommand::Bind);

        let mut buf = BytesMut::from(&b"\x04\x03\x00\x00\x00\x00\x00\x00\x00"[..]);
        let request = Socks4Codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(request.command, SocksCommand::UdpAssociate);

        let mut buf = BytesMut::from(&b"\x04\x09\x00\x50\x7f\x00\x00\x01\x00"[..]);
        assert_eq!(
            Socks4Codec.decode(&mut buf).unwrap().unwrap().command,
            SocksCommand::Unknown(9)
        );
    }

    #[test]
    fn test_decode_rejects_unterminated_user_id() {
        let mut buf = BytesMut::from(&b"\x04\x01\x00\x50\x7f\x00\x00\x01"[..]);
        buf.put_slice(&[b'a'; 300]);
        assert!(Socks4Codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_reply() {
        let mut out = BytesMut::new();
        Socks4Codec
            .encode(SocksReply::granted("10.0.0.1:8080".parse().unwrap()), &mut out)
            .unwrap();
        Socks4Codec.encode(SocksReply::failed(), &mut out).unwrap();
        assert_eq!(
            &out[..],
            b"\x00\x5a\x1f\x90\x0a\x00\x00\x01\x00\x5b\x00\x00\x00\x00\x00\x00"
        );
    }

    #[test]
    fn test_udp_envelope() {
        let peer: SocketAddrV4 = "192.168.1.7:53".parse().unwrap();
        let mut out = BytesMut::new();
        encode_udp_envelope(peer, b"query", &mut out);
        assert_eq!(&out[..10], b"\x00\x00\x00\x01\xc0\xa8\x01\x07\x00\x35");

        let (addr, payload) = decode_udp_envelope(&out).unwrap().unwrap();
        assert_eq!(addr, peer);
        assert_eq!(payload, b"query");

        let mut fragment = out.clone();
        fragment[2] = 1;
        assert!(decode_udp_envelope(&fragment).unwrap().is_none());

        let mut ipv6 = out.clone();
        ipv6[3] = 0x04;
        assert!(decode_udp_envelope(&ipv6).is_err());
        assert!(decode_udp_envelope(b"\x00\x00").is_err());
    }
}
