/// The two byte paths: HTTP(S) termination and raw TCP passthrough.
pub mod http;
pub mod tcp;
pub mod tls;

pub use http::EdgeHttpProxy;
pub use tcp::TcpPassthroughApp;
pub use tls::SniCertResolver;

/// Hop-by-hop headers stripped in both directions; everything else is
/// forwarded untouched
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];
