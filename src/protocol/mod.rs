//! Wire-level protocol support shared by the proxy sessions

pub mod chunked;
pub mod digest;
pub mod headers;
pub mod message;
pub mod socks;

pub use chunked::{encode_chunk, encode_last_chunk, parse_chunk, ChunkStatus, ChunkedDecoder};
pub use digest::{AuthOutcome, DigestAlgorithm, DigestAuthenticator, HttpDigest};
pub use headers::{HttpHeaders, HOP_BY_HOP};
pub use message::{
    format_error, make_error_response, parse_request_head, parse_response_head, BodyFraming,
    RequestHead, ResponseHead, MAX_HEAD_SIZE,
};
pub use socks::{Socks4Codec, SocksCommand, SocksReply, SocksRequest, SocksTarget};
