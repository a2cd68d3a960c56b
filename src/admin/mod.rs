/// REST admin API: thin JSON controllers over the supervisor, the
/// certificate manager, and the store. Runs as its own listening
/// service, separate from the proxy data path.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Response};
use pingora_core::apps::http_app::ServeHttp;
use pingora_core::protocols::http::ServerSession;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::certs::CertificateManager;
use crate::core::{Algorithm, SslMode};
use crate::error::{EdgeError, EdgeResult};
use crate::store::{CertificateRecord, PoolRecord};
use crate::supervisor::PoolSupervisor;

pub struct AdminApp {
    supervisor: Arc<PoolSupervisor>,
    certs: Arc<CertificateManager>,
    node_name: String,
    started_at: Instant,
}

#[derive(Debug, Deserialize)]
struct CreatePoolBody {
    name: String,
    algorithm: String,
    #[serde(default)]
    ssl_mode: Option<String>,
    #[serde(default)]
    ssl_domain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddBackendBody {
    url: String,
}

#[derive(Debug, Deserialize)]
struct RequestCertificateBody {
    domain: String,
}

impl AdminApp {
    pub fn new(
        supervisor: Arc<PoolSupervisor>,
        certs: Arc<CertificateManager>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            certs,
            node_name: node_name.into(),
            started_at: Instant::now(),
        }
    }

    /// Dispatch one admin request; factored out of the session handling
    /// so it can be exercised directly in tests
    pub async fn handle(&self, method: &Method, path: &str, body: Option<Bytes>) -> Response<Vec<u8>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let result = match (method.as_str(), segments.as_slice()) {
            ("GET", ["api", "health"]) => self.health(),
            ("GET", ["api", "pools"]) => self.list_pools().await,
            ("POST", ["api", "pools"]) => self.create_pool(body).await,
            ("GET", ["api", "pools", id]) => self.pool_detail(id).await,
            ("DELETE", ["api", "pools", id]) => self.delete_pool(id).await,
            ("POST", ["api", "pools", id, "backends"]) => self.add_backend(id, body).await,
            ("DELETE", ["api", "pools", id, "backends", rest @ ..]) => {
                self.remove_backend(id, &percent_decode(&rest.join("/"))).await
            }
            ("GET", ["api", "certificates"]) => self.list_certificates().await,
            ("POST", ["api", "certificates"]) => self.request_certificate(body).await,
            ("POST", ["api", "certificates", id, "renew"]) => self.renew_certificate(id).await,
            ("DELETE", ["api", "certificates", id]) => self.delete_certificate(id).await,
            ("GET", [".well-known", "acme-challenge", token]) => {
                return match self.certs.challenge(token).await {
                    Some(key_auth) => text_response(200, key_auth),
                    None => error_response(&EdgeError::NotFound("challenge token".into())),
                };
            }
            _ => Err(EdgeError::NotFound(format!("{method} {path}"))),
        };

        match result {
            Ok(response) => response,
            Err(e) => error_response(&e),
        }
    }

    fn health(&self) -> EdgeResult<Response<Vec<u8>>> {
        Ok(json_response(
            200,
            json!({
                "status": "healthy",
                "node": self.node_name,
                "uptime": self.started_at.elapsed().as_secs(),
            }),
        ))
    }

    async fn list_pools(&self) -> EdgeResult<Response<Vec<u8>>> {
        let pools: Vec<PoolRecord> = self.supervisor.store().list().await?;
        Ok(json_response(200, serde_json::to_value(pools).unwrap_or(Value::Null)))
    }

    async fn create_pool(&self, body: Option<Bytes>) -> EdgeResult<Response<Vec<u8>>> {
        let body: CreatePoolBody = parse_body(body)?;
        let algorithm = Algorithm::from_str(&body.algorithm)?;

        let mut record = PoolRecord::new(body.name, algorithm);
        if let Some(mode) = body.ssl_mode.as_deref() {
            record.ssl_mode = SslMode::from_str(mode)?;
            if record.ssl_mode == SslMode::FullStrict {
                record.validate_backend_cert = true;
            }
        }
        record.ssl_domain = body.ssl_domain;

        let record = self.supervisor.create_pool(record).await?;
        Ok(json_response(201, serde_json::to_value(record).unwrap_or(Value::Null)))
    }

    async fn pool_detail(&self, name: &str) -> EdgeResult<Response<Vec<u8>>> {
        let stats = self.supervisor.stats(name).await?;
        let backends = self.supervisor.pool(name).await?.list_backends().await?;
        Ok(json_response(
            200,
            json!({
                "stats": stats,
                "backends": backends,
            }),
        ))
    }

    async fn delete_pool(&self, name: &str) -> EdgeResult<Response<Vec<u8>>> {
        self.supervisor.delete_pool(name).await?;
        Ok(empty_response(204))
    }

    async fn add_backend(&self, pool: &str, body: Option<Bytes>) -> EdgeResult<Response<Vec<u8>>> {
        let body: AddBackendBody = parse_body(body)?;
        let backend = self.supervisor.add_backend(pool, &body.url).await?;
        Ok(json_response(201, serde_json::to_value(backend).unwrap_or(Value::Null)))
    }

    async fn remove_backend(&self, pool: &str, backend_id: &str) -> EdgeResult<Response<Vec<u8>>> {
        self.supervisor.remove_backend(pool, backend_id).await?;
        Ok(empty_response(204))
    }

    async fn list_certificates(&self) -> EdgeResult<Response<Vec<u8>>> {
        let certificates = self.certs.list().await?;
        let redacted: Vec<Value> = certificates
            .iter()
            .map(redact_certificate)
            .collect();
        Ok(json_response(200, Value::Array(redacted)))
    }

    async fn request_certificate(&self, body: Option<Bytes>) -> EdgeResult<Response<Vec<u8>>> {
        let body: RequestCertificateBody = parse_body(body)?;
        let record = self.certs.request(&body.domain).await?;
        Ok(json_response(201, redact_certificate(&record)))
    }

    async fn renew_certificate(&self, id: &str) -> EdgeResult<Response<Vec<u8>>> {
        let record = self.certs.renew(id).await?;
        Ok(json_response(200, redact_certificate(&record)))
    }

    async fn delete_certificate(&self, id: &str) -> EdgeResult<Response<Vec<u8>>> {
        self.certs.delete(id).await?;
        Ok(empty_response(204))
    }
}

#[async_trait]
impl ServeHttp for AdminApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let method = session.req_header().method.clone();
        let path = session.req_header().uri.path().to_string();
        let body = match session.read_request_body().await {
            Ok(body) => body,
            Err(e) => {
                log::debug!("admin request body read failed: {e}");
                return error_response(&EdgeError::ClientIo(e.to_string()));
            }
        };
        self.handle(&method, &path, body).await
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Option<Bytes>) -> EdgeResult<T> {
    let body = body.ok_or_else(|| EdgeError::validation("request body required"))?;
    serde_json::from_slice(&body).map_err(|e| EdgeError::validation(format!("invalid body: {e}")))
}

/// Private key material never leaves the node over the admin API
fn redact_certificate(record: &CertificateRecord) -> Value {
    let mut value = serde_json::to_value(record).unwrap_or(Value::Null);
    if let Some(object) = value.as_object_mut() {
        object.remove("private_key");
    }
    value
}

fn json_response(code: u16, body: Value) -> Response<Vec<u8>> {
    let body = body.to_string().into_bytes();
    Response::builder()
        .status(code)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response parts")
}

fn text_response(code: u16, body: String) -> Response<Vec<u8>> {
    let body = body.into_bytes();
    Response::builder()
        .status(code)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .header(http::header::CONTENT_LENGTH, body.len())
        .body(body)
        .expect("static response parts")
}

fn empty_response(code: u16) -> Response<Vec<u8>> {
    Response::builder()
        .status(code)
        .header(http::header::CONTENT_LENGTH, 0)
        .body(Vec::new())
        .expect("static response parts")
}

fn error_response(error: &EdgeError) -> Response<Vec<u8>> {
    json_response(error.http_status(), json!({ "error": error.to_string() }))
}

/// Minimal percent-decoding for backend ids in URL paths
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                output.push(byte);
                i += 3;
                continue;
            }
        }
        output.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&output).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PoolRegistry;
    use crate::store::Store;

    async fn app() -> (AdminApp, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let supervisor = Arc::new(PoolSupervisor::new(
            Arc::clone(&store),
            Arc::new(PoolRegistry::new()),
            60_000,
        ));
        let _watcher = supervisor.start().await.unwrap();
        let certs = Arc::new(CertificateManager::new(store));
        (AdminApp::new(supervisor, certs, "node-test"), dir)
    }

    fn body(value: Value) -> Option<Bytes> {
        Some(Bytes::from(value.to_string()))
    }

    fn parse(response: &Response<Vec<u8>>) -> Value {
        serde_json::from_slice(response.body()).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _dir) = app().await;
        let response = app.handle(&Method::GET, "/api/health", None).await;
        assert_eq!(response.status(), 200);
        let value = parse(&response);
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["node"], "node-test");
        assert!(value["uptime"].is_u64());
    }

    #[tokio::test]
    async fn test_pool_crud_lifecycle() {
        let (app, _dir) = app().await;

        let response = app
            .handle(
                &Method::POST,
                "/api/pools",
                body(json!({"name": "web", "algorithm": "round_robin"})),
            )
            .await;
        assert_eq!(response.status(), 201);

        // Duplicate name conflicts
        let response = app
            .handle(
                &Method::POST,
                "/api/pools",
                body(json!({"name": "web", "algorithm": "random"})),
            )
            .await;
        assert_eq!(response.status(), 409);

        let response = app.handle(&Method::GET, "/api/pools", None).await;
        assert_eq!(response.status(), 200);
        assert_eq!(parse(&response).as_array().unwrap().len(), 1);

        let response = app
            .handle(
                &Method::POST,
                "/api/pools/web/backends",
                body(json!({"url": "http://10.0.0.1:3000"})),
            )
            .await;
        assert_eq!(response.status(), 201);

        let response = app.handle(&Method::GET, "/api/pools/web", None).await;
        assert_eq!(response.status(), 200);
        let detail = parse(&response);
        assert_eq!(detail["stats"]["total_backends"], 1);
        assert_eq!(detail["backends"][0]["host"], "10.0.0.1");

        let response = app
            .handle(
                &Method::DELETE,
                "/api/pools/web/backends/http%3A%2F%2F10.0.0.1%3A3000",
                None,
            )
            .await;
        assert_eq!(response.status(), 204);

        let response = app.handle(&Method::DELETE, "/api/pools/web", None).await;
        assert_eq!(response.status(), 204);

        let response = app.handle(&Method::GET, "/api/pools/web", None).await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_create_pool_validation() {
        let (app, _dir) = app().await;

        let response = app
            .handle(
                &Method::POST,
                "/api/pools",
                body(json!({"name": "web", "algorithm": "fastest"})),
            )
            .await;
        assert_eq!(response.status(), 422);

        let response = app.handle(&Method::POST, "/api/pools", None).await;
        assert_eq!(response.status(), 422);
        assert!(parse(&response)["error"].is_string());
    }

    #[tokio::test]
    async fn test_certificate_endpoints() {
        let (app, _dir) = app().await;

        let response = app
            .handle(
                &Method::POST,
                "/api/certificates",
                body(json!({"domain": "example.com"})),
            )
            .await;
        assert_eq!(response.status(), 201);
        let created = parse(&response);
        assert_eq!(created["domain"], "example.com");
        assert!(created.get("private_key").is_none());
        let id = created["id"].as_str().unwrap().to_string();

        let response = app.handle(&Method::GET, "/api/certificates", None).await;
        assert_eq!(response.status(), 200);
        assert_eq!(parse(&response).as_array().unwrap().len(), 1);

        let response = app
            .handle(&Method::POST, &format!("/api/certificates/{id}/renew"), None)
            .await;
        assert_eq!(response.status(), 200);

        let response = app
            .handle(&Method::DELETE, &format!("/api/certificates/{id}"), None)
            .await;
        assert_eq!(response.status(), 204);

        let response = app
            .handle(&Method::POST, &format!("/api/certificates/{id}/renew"), None)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_acme_challenge_endpoint() {
        let (app, _dir) = app().await;
        app.certs
            .set_challenge("tok123".into(), "tok123.auth".into())
            .await;

        let response = app
            .handle(&Method::GET, "/.well-known/acme-challenge/tok123", None)
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"tok123.auth");

        let response = app
            .handle(&Method::GET, "/.well-known/acme-challenge/other", None)
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _dir) = app().await;
        let response = app.handle(&Method::GET, "/api/unknown", None).await;
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(
            percent_decode("http%3A%2F%2Fa%3A1"),
            "http://a:1"
        );
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
