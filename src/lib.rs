//! JWT authentication for gateways: locates a bearer credential in the request, verifies it
//! against a remote JWKS refreshed on demand, and hands back the token's private claims.

mod axum;
mod config;
mod locate;
mod pipeline;
mod remote;
mod validator;

use std::fmt;

pub use crate::axum::{protected_resource_router, AuthRejection, Authenticated};
pub use crate::config::{
    Config, ConfigBuilder, LocationRule, ProtectedResource, ResourceMetadata,
    UnauthenticatedHeader, DEFAULT_FETCH_TIMEOUT, DEFAULT_METADATA_PATH, DEFAULT_POLL_INTERVAL,
};
pub use crate::locate::CredentialLocator;
pub use crate::pipeline::{AuthenticationPipeline, Unauthorized};
pub use crate::remote::{HttpJwksFetcher, JwksFetcher, KeyCache, KeySet, VerificationKey};
pub use crate::validator::{TokenValidator, ValidatedClaims};

/// Errors produced while building or running the authentication pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration is incomplete or contains an invalid value.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The key set could not be fetched from the remote endpoint.
    #[error("failed to fetch key set: {0}")]
    KeyFetchFailed(#[from] FetchError),

    /// The token envelope could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(#[source] jsonwebtoken::errors::Error),

    /// No key in the current key set matches the token's key id.
    #[error("no key found for key id {0:?}")]
    KeyNotFound(Option<String>),

    /// The signature did not verify against the selected key.
    #[error("invalid signature: {0}")]
    SignatureInvalid(#[source] jsonwebtoken::errors::Error),

    /// Expiry, not-before, issuer or audience validation failed.
    #[error("claim validation failed: {0}")]
    ClaimMismatch(#[source] jsonwebtoken::errors::Error),

    /// None of the configured locations contained a token.
    #[error("no token found")]
    NoCredential,
}

impl Error {
    /// The classification of this error, suitable for diagnostics.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::KeyFetchFailed(_) => ErrorKind::KeyFetchFailed,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::KeyNotFound(_) | Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::ClaimMismatch(_) => ErrorKind::ClaimMismatch,
            Self::NoCredential => ErrorKind::NoCredential,
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(err: derive_builder::UninitializedFieldError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}

/// Coarse classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigInvalid,
    KeyFetchFailed,
    Malformed,
    SignatureInvalid,
    ClaimMismatch,
    NoCredential,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigInvalid => "config_invalid",
            Self::KeyFetchFailed => "key_fetch_failed",
            Self::Malformed => "malformed",
            Self::SignatureInvalid => "signature_invalid",
            Self::ClaimMismatch => "claim_mismatch",
            Self::NoCredential => "no_credential",
        };
        f.write_str(name)
    }
}

/// Errors raised while retrieving the remote JWKS document.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The request could not be sent or timed out.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint answered with a non-success status.
    #[error("{url} responded with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The response body is not a JWKS document.
    #[error("invalid key set document from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A refresh this caller was waiting on failed.
    #[error("concurrent key set refresh failed: {reason}")]
    ConcurrentRefreshFailed { reason: String },
}
