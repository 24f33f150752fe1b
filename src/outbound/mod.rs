//! Outbound connections: direct dialing and remote proxy hosts

pub mod direct;
mod probe;
mod stream;
pub mod tls;
mod transport;

pub use probe::{DetectProbe, DETECT_TIMEOUT};
pub use stream::{RemoteReader, RemoteStream, RemoteWriter, TunnelStream};
pub use transport::{
    ProxyTransport, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIMEOUT, PROXY_DIAL_TIMEOUT,
    PROXY_REQUEST_TIMEOUT, TLS_HANDSHAKE_TIMEOUT,
};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Request/response body used on every hop
pub type BoxBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn empty() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
