use async_trait::async_trait;
use thiserror::Error;

use crate::server_name::ServerName;

/// Every variant is recoverable: resolution records it and moves on to the
/// SRV fallbacks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WellKnownError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("status {status}")]
    Status { status: u16 },
    #[error("unparseable document: {0}")]
    Malformed(String),
}

/// Fetches the `m.server` value of `https://<name>/.well-known/matrix/server`.
#[async_trait]
pub trait WellKnownSource: Send + Sync {
    async fn fetch_well_known(&self, server_name: &ServerName) -> Result<String, WellKnownError>;
}

/// Parses the delegated `m.server` value. An empty value, a scheme, or a
/// value that is not a server name is treated as an unparseable document.
pub fn parse_delegation(value: &str) -> Result<ServerName, WellKnownError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(WellKnownError::Malformed("m.server is empty".into()));
    }
    ServerName::parse(trimmed).map_err(|err| WellKnownError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_host_and_port() {
        let name = parse_delegation("deleg.example.org:1234").unwrap();
        assert_eq!(name.port(), Some(1234));
    }

    #[test]
    fn rejects_scheme_and_empty_values() {
        assert!(matches!(
            parse_delegation("https://deleg.example.org"),
            Err(WellKnownError::Malformed(_))
        ));
        assert!(matches!(
            parse_delegation("  "),
            Err(WellKnownError::Malformed(_))
        ));
    }
}
