/// Backend value type: a single upstream target with volatile counters.
///
/// A `Backend` flowing outside its owning pool is a snapshot; the pool
/// actor holds the only mutable copy.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EdgeError, EdgeResult};
use crate::utils::now_millis;

/// Upstream scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Default port used when the URL does not carry one
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A single upstream server target identified by scheme/host/port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub weight: usize,
    pub healthy: bool,
    pub current_connections: u64,
    pub total_requests: u64,
    /// Unix millis of the last completed health probe
    pub last_check: Option<u64>,
    pub ssl_verify: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Backend {
    /// Parse `scheme://host:port[/...]` into a backend.
    ///
    /// The path component is ignored; missing host or unknown scheme is
    /// rejected. A missing port falls back to the scheme default.
    pub fn new(url: &str) -> EdgeResult<Self> {
        let url = url.trim();
        let (scheme, rest) = match url.split_once("://") {
            Some((s, rest)) => (s, rest),
            None => return Err(EdgeError::InvalidUrl(format!("{url}: missing scheme"))),
        };

        let scheme = match scheme {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(EdgeError::InvalidUrl(format!(
                    "{url}: unknown scheme '{other}'"
                )))
            }
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        if authority.is_empty() {
            return Err(EdgeError::InvalidUrl(format!("{url}: missing host")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u16>().map_err(|_| {
                    EdgeError::InvalidUrl(format!("{url}: invalid port '{port_str}'"))
                })?;
                (host, port)
            }
            None => (authority, scheme.default_port()),
        };

        if host.is_empty() {
            return Err(EdgeError::InvalidUrl(format!("{url}: missing host")));
        }

        let now = now_millis();
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            weight: 1,
            // Optimistic until the first probe completes
            healthy: true,
            current_connections: 0,
            total_requests: 0,
            last_check: None,
            ssl_verify: true,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Stable identity within a pool
    pub fn id(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }

    /// host:port form used when dialing
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Record a probe result, stamping the check time
    pub fn set_health(&mut self, ok: bool) {
        self.healthy = ok;
        self.last_check = Some(now_millis());
        self.updated_at = now_millis();
    }

    /// Account one selection: bumps the live counter and the running total
    pub fn inc_connections(&mut self) {
        self.current_connections += 1;
        self.total_requests += 1;
    }

    /// Account one release; saturates at zero
    pub fn dec_connections(&mut self) {
        self.current_connections = self.current_connections.saturating_sub(1);
    }
}
