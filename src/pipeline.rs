use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;

use crate::config::Config;
use crate::locate::CredentialLocator;
use crate::remote::{HttpJwksFetcher, KeyCache};
use crate::validator::{TokenValidator, ValidatedClaims};
use crate::{Error, ErrorKind};

/// A rejected authentication attempt. The underlying error is kept for diagnostics.
#[derive(Debug, thiserror::Error)]
#[error("unauthorized: {source}")]
pub struct Unauthorized {
    #[source]
    source: Error,
}

impl Unauthorized {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn error(&self) -> &Error {
        &self.source
    }

    pub fn into_error(self) -> Error {
        self.source
    }
}

impl From<Error> for Unauthorized {
    fn from(source: Error) -> Self {
        Self { source }
    }
}

/// Locates the token in a request, then validates it.
pub struct AuthenticationPipeline {
    locator: CredentialLocator,
    validator: TokenValidator,
    unauthenticated_headers: HeaderMap,
    /// Path and body of the protected resource metadata document
    metadata: Option<(String, Value)>,
}

impl AuthenticationPipeline {
    /// Builds the pipeline and loads the remote key set once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the HTTP client cannot be built and
    /// [`Error::KeyFetchFailed`] if the initial key set cannot be loaded.
    pub async fn from_config(config: Config) -> Result<Self, Error> {
        let fetcher = HttpJwksFetcher::new(config.jwks_url(), config.fetch_timeout())?;
        let keys = KeyCache::new(fetcher, config.poll_interval()).await?;

        tracing::info!(
            jwks_url = %config.jwks_url(),
            poll_interval = ?config.poll_interval(),
            locations = config.locations().len(),
            "Initialized JWT authentication"
        );

        Ok(Self::new(&config, Arc::new(keys)))
    }

    /// Builds the pipeline around an existing key cache, which may be shared with other
    /// pipelines using the same key source.
    pub fn new(config: &Config, keys: Arc<KeyCache>) -> Self {
        Self {
            locator: CredentialLocator::new(config.locations().to_vec()),
            validator: TokenValidator::new(
                keys,
                config.issuer().map(str::to_owned),
                config.audience().map(str::to_owned),
            ),
            unauthenticated_headers: config.unauthenticated_headers(),
            metadata: config.protected_resource().map(|resource| {
                (
                    resource.metadata_path.clone(),
                    resource.document(config.jwks_url()),
                )
            }),
        }
    }

    /// Authenticates a request and returns its private claims serialized as JSON.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Vec<u8>, Unauthorized> {
        self.authenticate_claims(headers)
            .await
            .map(|claims| claims.to_bytes())
    }

    /// Authenticates a request and returns its private claims.
    ///
    /// A request without a token is rejected before the key set is consulted.
    pub async fn authenticate_claims(
        &self,
        headers: &HeaderMap,
    ) -> Result<ValidatedClaims, Unauthorized> {
        let result = match self.locator.locate(headers) {
            Some(token) => self.validator.validate(token).await,
            None => Err(Error::NoCredential),
        };

        result.map_err(|err| {
            tracing::debug!(kind = %err.kind(), error = %err, "Authentication failed");
            Unauthorized::from(err)
        })
    }

    /// Headers to attach to rejections.
    pub fn unauthenticated_headers(&self) -> &HeaderMap {
        &self.unauthenticated_headers
    }

    /// The protected resource metadata document and the path it is served on, if configured.
    pub fn metadata_endpoint(&self) -> Option<(&str, &Value)> {
        self.metadata
            .as_ref()
            .map(|(path, document)| (path.as_str(), document))
    }
}
