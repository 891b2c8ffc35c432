//! HTTP client for the Matrix federation endpoints and the handful of
//! client-server endpoints the diagnoser needs.
//!
//! Federation calls go straight to a resolved endpoint with the TLS server
//! name pinned. The public key and version endpoints are unauthenticated;
//! event and state endpoints take a [`RequestSigner`] holding the origin
//! server's signing key. Homeserver calls use a bearer token.

mod federation;
mod homeserver;
mod signing;
pub mod types;

pub use federation::{EndpointAddr, FederationClient, FederationClientConfig, Scheme};
pub use homeserver::{HomeserverClient, PaginationDirection};
pub use signing::{RequestSigner, canonical_json};

pub use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

impl FederationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_timeout())
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_connect())
    }

    /// Best-effort detection of certificate and handshake failures. reqwest
    /// does not expose a TLS error kind, so this inspects the source chain.
    pub fn is_tls(&self) -> bool {
        let Self::Http(err) = self else {
            return false;
        };
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(source) = current {
            let text = source.to_string().to_ascii_lowercase();
            if ["certificate", "tls", "ssl", "handshake"]
                .iter()
                .any(|needle| text.contains(needle))
            {
                return true;
            }
            current = source.source();
        }
        false
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            _ => None,
        }
    }
}

impl From<url::ParseError> for FederationError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}
