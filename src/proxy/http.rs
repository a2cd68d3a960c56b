/// HTTP(S) terminating proxy.
///
/// One `ProxyHttp` service fronts every non-passthrough pool: the
/// request is resolved to a pool, a backend is selected under a release
/// guard, and the request is streamed upstream with hop-by-hop headers
/// stripped in both directions. The guard lives in the per-request
/// context, so the connection count is released on every exit path.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_core::{Error, ErrorType, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::certs::CertificateManager;
use crate::core::{Backend, PoolHandle, PoolRegistry, SelectionGuard, SslMode};
use crate::proxy::HOP_BY_HOP_HEADERS;
use crate::routing::{RouteResolver, POOL_HEADER};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Backend connect deadline
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EdgeHttpProxy {
    registry: Arc<PoolRegistry>,
    resolver: RouteResolver,
    certs: Arc<CertificateManager>,
    /// Fallback request deadline when the pool does not override it
    default_timeout_ms: u64,
}

/// Per-request state carried across the proxy phases
pub struct RequestContext {
    pool: Option<PoolHandle>,
    backend: Option<Backend>,
    ssl_mode: SslMode,
    timeout_ms: u64,
    /// Releases the selection on drop, whatever the exit path
    _guard: Option<SelectionGuard>,
}

impl EdgeHttpProxy {
    pub fn new(
        registry: Arc<PoolRegistry>,
        resolver: RouteResolver,
        certs: Arc<CertificateManager>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            resolver,
            certs,
            default_timeout_ms,
        }
    }

    /// Pool resolution with fallback to the default pool when the named
    /// pool is not running
    async fn resolve_pool(&self, host: Option<&str>, pool_header: Option<&str>) -> Option<PoolHandle> {
        let name = self.resolver.resolve(host, pool_header);
        if let Some(handle) = self.registry.get(&name).await {
            return Some(handle);
        }
        if name != self.resolver.default_pool() {
            return self.registry.get(self.resolver.default_pool()).await;
        }
        None
    }
}

/// Write a small JSON error response and finish the request
async fn respond_json(session: &mut Session, code: u16, message: &str) -> Result<()> {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut resp = ResponseHeader::build(code, Some(2))?;
    resp.insert_header(header::CONTENT_TYPE, "application/json")?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(resp)).await?;
    session
        .write_response_body(Bytes::from(body), true)
        .await?;
    Ok(())
}

async fn respond_text(session: &mut Session, code: u16, body: String) -> Result<()> {
    let mut resp = ResponseHeader::build(code, Some(2))?;
    resp.insert_header(header::CONTENT_TYPE, "text/plain")?;
    resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
    session.write_response_header(Box::new(resp)).await?;
    session
        .write_response_body(Bytes::from(body), true)
        .await?;
    Ok(())
}

/// Drop hop-by-hop headers and the routing header, and point Host at
/// the backend authority
fn sanitize_upstream_request(
    upstream_request: &mut RequestHeader,
    backend_authority: Option<&str>,
) -> Result<()> {
    for name in HOP_BY_HOP_HEADERS {
        upstream_request.remove_header(name);
    }
    upstream_request.remove_header(POOL_HEADER);

    if let Some(authority) = backend_authority {
        upstream_request.insert_header(header::HOST, authority.to_string())?;
    }
    Ok(())
}

/// Drop hop-by-hop headers from the backend response
fn sanitize_response(upstream_response: &mut ResponseHeader) {
    for name in HOP_BY_HOP_HEADERS {
        upstream_response.remove_header(name);
    }
}

fn header_str<'a>(req: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Host the request was addressed to: Host header first, then the h2
/// authority
fn request_host(req: &RequestHeader) -> Option<String> {
    if let Some(host) = header_str(req, "host") {
        return Some(host.to_string());
    }
    req.uri.authority().map(|a| a.as_str().to_string())
}

#[async_trait]
impl ProxyHttp for EdgeHttpProxy {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext {
            pool: None,
            backend: None,
            ssl_mode: SslMode::Off,
            timeout_ms: self.default_timeout_ms,
            _guard: None,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        // ACME HTTP-01 answers are served by the edge itself
        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return match self.certs.challenge(token).await {
                Some(key_auth) => {
                    respond_text(session, 200, key_auth).await?;
                    Ok(true)
                }
                None => {
                    respond_json(session, 404, "unknown challenge token").await?;
                    Ok(true)
                }
            };
        }

        let host = request_host(session.req_header());
        let pool_header = header_str(session.req_header(), POOL_HEADER).map(str::to_string);

        let Some(pool) = self
            .resolve_pool(host.as_deref(), pool_header.as_deref())
            .await
        else {
            log::warn!("no pool resolvable for host {host:?}");
            respond_json(session, 503, "No healthy backends available").await?;
            return Ok(true);
        };

        let config = pool.config().await;
        if config.ssl_mode == SslMode::Passthrough {
            // Passthrough pools are never served from the HTTP listener
            log::warn!("HTTP request routed to passthrough pool {}", pool.name());
            respond_json(session, 502, "pool is configured for TCP passthrough").await?;
            return Ok(true);
        }

        match pool.select_backend().await {
            Ok((backend, guard)) => {
                log::debug!(
                    "pool {}: selected backend {} for {}",
                    pool.name(),
                    backend.id(),
                    path
                );
                ctx.ssl_mode = config.ssl_mode;
                ctx.timeout_ms = config.request_timeout_ms;
                ctx.backend = Some(backend);
                ctx.pool = Some(pool);
                ctx._guard = Some(guard);
                Ok(false)
            }
            Err(e) => {
                log::warn!("pool {}: selection failed: {e}", pool.name());
                respond_json(session, 503, "No healthy backends available").await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let backend = ctx
            .backend
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no backend selected"))?;

        let upstream_tls = ctx.ssl_mode.upstream_tls();
        let sni = backend.host.clone();
        let mut peer = HttpPeer::new(backend.addr(), upstream_tls, sni);

        peer.options.connection_timeout = Some(CONNECT_TIMEOUT);
        let deadline = Duration::from_millis(ctx.timeout_ms);
        peer.options.read_timeout = Some(deadline);
        peer.options.write_timeout = Some(deadline);

        // `full` accepts any upstream certificate; `full_strict`
        // verifies the chain and the hostname
        if upstream_tls {
            let strict = ctx.ssl_mode == SslMode::FullStrict;
            peer.options.verify_cert = strict;
            peer.options.verify_hostname = strict;
        }

        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let authority = ctx.backend.as_ref().map(|b| b.addr());
        sanitize_upstream_request(upstream_request, authority.as_deref())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        sanitize_response(upstream_response);
        Ok(())
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16
    where
        Self::CTX: Send + Sync,
    {
        // Mid-stream upstream failures close the connection without a
        // status rewrite; only pre-response failures get a 5xx body
        if session.response_written().is_some() {
            log::debug!("upstream failed mid-stream: {e}");
            return 0;
        }

        let (code, message) = match e.etype() {
            ErrorType::ConnectTimedout | ErrorType::ConnectRefused | ErrorType::ConnectError => {
                (502, "backend connect failed")
            }
            ErrorType::TLSHandshakeFailure | ErrorType::InvalidCert => {
                (502, "backend TLS verification failed")
            }
            ErrorType::ReadTimedout | ErrorType::WriteTimedout => (504, "upstream timed out"),
            ErrorType::ReadError | ErrorType::WriteError => {
                if matches!(e.esource(), pingora_core::ErrorSource::Downstream) {
                    (400, "client I/O error")
                } else {
                    (502, "upstream I/O error")
                }
            }
            _ => (502, "bad gateway"),
        };

        if let Some(backend) = &ctx.backend {
            log::warn!("proxy error for backend {}: {e}", backend.id());
        } else {
            log::warn!("proxy error before selection: {e}");
        }

        let _ = respond_json(session, code, message).await;
        code
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let status = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);
        if let (Some(pool), Some(backend)) = (&ctx.pool, &ctx.backend) {
            match e {
                Some(e) => log::debug!(
                    "{} -> {} status {} error {e}",
                    pool.name(),
                    backend.id(),
                    status
                ),
                None => log::debug!("{} -> {} status {}", pool.name(), backend.id(), status),
            }
        }
        // ctx drops here; the selection guard releases the backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RequestHeader {
        let mut req = RequestHeader::build("GET", b"/orders?page=2", None).unwrap();
        req.insert_header("Host", "api.example.com").unwrap();
        req.insert_header("Connection", "keep-alive, X-Trace").unwrap();
        req.insert_header("X-Trace", "42").unwrap();
        req.insert_header("Transfer-Encoding", "chunked").unwrap();
        req.insert_header("Proxy-Authorization", "Basic abc").unwrap();
        req.insert_header("X-Pool", "billing").unwrap();
        req
    }

    #[test]
    fn test_upstream_request_strips_hop_by_hop() {
        let mut req = request();
        sanitize_upstream_request(&mut req, Some("10.0.0.1:3000")).unwrap();

        assert!(req.headers.get("connection").is_none());
        assert!(req.headers.get("transfer-encoding").is_none());
        assert!(req.headers.get("proxy-authorization").is_none());
        assert!(req.headers.get("x-pool").is_none());
        // End-to-end headers pass through, even ones named in Connection
        assert_eq!(req.headers.get("x-trace").unwrap(), "42");
    }

    #[test]
    fn test_upstream_request_rewrites_host() {
        let mut req = request();
        sanitize_upstream_request(&mut req, Some("10.0.0.1:3000")).unwrap();
        assert_eq!(req.headers.get("host").unwrap(), "10.0.0.1:3000");
    }

    #[test]
    fn test_response_strips_hop_by_hop() {
        let mut resp = ResponseHeader::build(200, None).unwrap();
        resp.insert_header("Connection", "close").unwrap();
        resp.insert_header("Keep-Alive", "timeout=5").unwrap();
        resp.insert_header("Upgrade", "h2c").unwrap();
        resp.insert_header("X-Resp", "ok").unwrap();

        sanitize_response(&mut resp);

        assert!(resp.headers.get("connection").is_none());
        assert!(resp.headers.get("keep-alive").is_none());
        assert!(resp.headers.get("upgrade").is_none());
        assert_eq!(resp.headers.get("x-resp").unwrap(), "ok");
    }
}
