//! CredHub backend for the credbroker credential-store capability.
//!
//! This crate provides `CredhubClient`, an HTTP implementation of
//! `credbroker_store::CredentialStore` against the CredHub v1 data and
//! v1/v2 permissions APIs, with UAA client-credentials authentication
//! (`UaaTokenSource`) and an optional private CA bundle.

pub mod client;
pub mod config;
pub mod uaa;

pub use client::CredhubClient;
pub use config::CredhubConfig;
pub use uaa::UaaTokenSource;

use credbroker_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredhubError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("CredHub I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("CredHub config error: {0}")]
    Config(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("unexpected response from {url}: {reason}")]
    UnexpectedResponse { url: String, reason: String },
}

impl From<CredhubError> for StoreError {
    fn from(e: CredhubError) -> Self {
        match e {
            CredhubError::NotFound(msg) => StoreError::NotFound(msg),
            CredhubError::Conflict(msg) => StoreError::Conflict(msg),
            CredhubError::Auth(msg) => StoreError::Auth(msg),
            CredhubError::Io(e) => StoreError::Io(e),
            CredhubError::Serialization(e) => StoreError::Serialization(e),
            other => StoreError::Http(other.to_string()),
        }
    }
}
