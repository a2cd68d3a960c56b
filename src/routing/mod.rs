/// Maps inbound request metadata to a pool name.
///
/// Priority: explicit `X-Pool` header, then subdomain extraction against
/// the configured base domain, then the default pool. The resolver is
/// stateless; a resolved name may still miss the registry if the pool
/// was deleted moments ago.
/// Header consulted before any host inspection
pub const POOL_HEADER: &str = "x-pool";

#[derive(Debug, Clone)]
pub struct RouteResolver {
    base_domain: String,
    default_pool: String,
}

impl RouteResolver {
    pub fn new(base_domain: impl Into<String>, default_pool: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            default_pool: default_pool.into(),
        }
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    /// Resolve to a pool name; total, never fails
    pub fn resolve(&self, host: Option<&str>, pool_header: Option<&str>) -> String {
        if let Some(name) = pool_header {
            let name = name.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }

        let Some(host) = host else {
            return self.default_pool.clone();
        };
        // Ignore an explicit port in the Host header
        let host = host.split(':').next().unwrap_or(host);

        if host == self.base_domain {
            return self.default_pool.clone();
        }

        if let Some(label) = host.strip_suffix(&format!(".{}", self.base_domain)) {
            if label.is_empty() {
                return self.default_pool.clone();
            }
            // Only the leading label names the pool
            return label.split('.').next().unwrap_or(label).to_string();
        }

        // Unknown hosts fall back to the default pool; a custom-domain
        // table may take over this branch later
        self.default_pool.clone()
    }
}
