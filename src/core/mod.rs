/// Core request-path abstractions: backend values, selection algorithms,
/// and the pool actor that owns them.
pub mod algorithm;
pub mod backend;
pub mod pool;

pub use algorithm::{select, Algorithm, AlgorithmState};
pub use backend::{Backend, Scheme};
pub use pool::{Pool, PoolConfig, PoolHandle, PoolRegistry, PoolStats, SelectionGuard};

use serde::{Deserialize, Serialize};

/// The edge's treatment of TLS between client/edge and edge/backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SslMode {
    /// Plain HTTP on both legs
    #[default]
    Off,
    /// TLS to the client, plain HTTP to the backend
    Flexible,
    /// TLS on both legs, backend certificate accepted without verification
    Full,
    /// TLS on both legs, backend chain and hostname fully verified
    FullStrict,
    /// Layer-4 forwarding, no TLS termination at the edge
    Passthrough,
}

impl SslMode {
    /// Whether the listener terminates TLS for pools in this mode
    pub fn terminates_tls(&self) -> bool {
        matches!(
            self,
            SslMode::Flexible | SslMode::Full | SslMode::FullStrict
        )
    }

    /// Whether the edge dials the backend over TLS
    pub fn upstream_tls(&self) -> bool {
        matches!(self, SslMode::Full | SslMode::FullStrict)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SslMode::Off => "off",
            SslMode::Flexible => "flexible",
            SslMode::Full => "full",
            SslMode::FullStrict => "full_strict",
            SslMode::Passthrough => "passthrough",
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = crate::error::EdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(SslMode::Off),
            "flexible" => Ok(SslMode::Flexible),
            "full" => Ok(SslMode::Full),
            "full_strict" => Ok(SslMode::FullStrict),
            "passthrough" => Ok(SslMode::Passthrough),
            other => Err(crate::error::EdgeError::validation(format!(
                "unknown ssl_mode: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::from_str("off").unwrap(), SslMode::Off);
        assert_eq!(
            SslMode::from_str("full_strict").unwrap(),
            SslMode::FullStrict
        );
        assert_eq!(
            SslMode::from_str("passthrough").unwrap(),
            SslMode::Passthrough
        );
        assert!(SslMode::from_str("tls").is_err());
    }

    #[test]
    fn test_ssl_mode_legs() {
        assert!(!SslMode::Off.terminates_tls());
        assert!(SslMode::Flexible.terminates_tls());
        assert!(!SslMode::Flexible.upstream_tls());
        assert!(SslMode::Full.upstream_tls());
        assert!(SslMode::FullStrict.upstream_tls());
        assert!(!SslMode::Passthrough.terminates_tls());
    }
}
