use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Error, FetchError};

/// Source of JWKS documents.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, FetchError>;
}

/// Fetches the JWKS document from a URL over HTTP.
#[derive(Clone)]
pub struct HttpJwksFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Creates a fetcher whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(client_error)?;

        Ok(Self::with_client(url, client))
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

fn client_error(err: reqwest::Error) -> Error {
    Error::ConfigInvalid(format!("failed to build HTTP client: {err}"))
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwkSet, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: self.url.clone(),
                status,
            });
        }

        response
            .json::<JwkSet>()
            .await
            .map_err(|source| FetchError::Decode {
                url: self.url.clone(),
                source,
            })
    }
}

/// A key usable for signature verification.
pub struct VerificationKey {
    kid: Option<String>,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

/// An immutable snapshot of the remote key set.
pub struct KeySet {
    keys: Vec<VerificationKey>,
    fetched_at: Instant,
}

impl KeySet {
    /// Converts a JWKS document, skipping keys that cannot verify signatures.
    fn from_jwks(jwks: &JwkSet, fetched_at: Instant) -> Self {
        let keys = jwks
            .keys
            .iter()
            .filter_map(|jwk| {
                let kid = jwk.common.key_id.clone();
                if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                    tracing::debug!(?kid, "Skipping encryption key");
                    return None;
                }
                match DecodingKey::from_jwk(jwk) {
                    Ok(key) => Some(VerificationKey { kid, key }),
                    Err(err) => {
                        tracing::warn!(?kid, error = %err, "Skipping unusable JWK");
                        None
                    }
                }
            })
            .collect();

        Self { keys, fetched_at }
    }

    /// Keys to try for a token. With a key id only the matching key qualifies; without one,
    /// every key does.
    pub fn candidates<'a>(
        &'a self,
        kid: Option<&'a str>,
    ) -> impl Iterator<Item = &'a VerificationKey> + 'a {
        self.keys.iter().filter(move |key| match kid {
            Some(kid) => key.kid() == Some(kid),
            None => true,
        })
    }

    /// The key with the given id, if any.
    pub fn find(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.iter().find(|key| key.kid() == Some(kid))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no usable key was published.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// When this snapshot was fetched.
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }
}

/// Remote key set cache.
///
/// The key set is fetched when the cache is created and again whenever a caller finds it older
/// than the poll interval. Snapshots are swapped atomically, so readers never wait on a fetch
/// and keep a consistent view for as long as they hold one. A failed fetch keeps the previous
/// snapshot and its timestamp, so the next caller tries again. Callers that were already
/// waiting on a fetch that fails share its failure instead of fetching one after another.
pub struct KeyCache {
    fetcher: Box<dyn JwksFetcher>,
    poll_interval: Duration,
    snapshot: ArcSwap<KeySet>,
    /// Held by the one caller refreshing the key set. Holds the last failure message.
    refresh: Mutex<Option<String>>,
    /// Bumped on every failed refresh, under `refresh`
    failed_refreshes: AtomicU64,
}

impl KeyCache {
    /// Creates the cache and loads the key set once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyFetchFailed`] if the initial fetch fails.
    pub async fn new(
        fetcher: impl JwksFetcher + 'static,
        poll_interval: Duration,
    ) -> Result<Self, Error> {
        let fetcher: Box<dyn JwksFetcher> = Box::new(fetcher);
        let jwks = fetcher.fetch().await?;
        let key_set = KeySet::from_jwks(&jwks, Instant::now());
        tracing::info!(key_count = key_set.len(), "Loaded JWKS");

        Ok(Self {
            fetcher,
            poll_interval,
            snapshot: ArcSwap::from_pointee(key_set),
            refresh: Mutex::new(None),
            failed_refreshes: AtomicU64::new(0),
        })
    }

    /// Refreshes the key set if the poll interval has elapsed since the last successful fetch.
    ///
    /// # Errors
    ///
    /// Returns the [`FetchError`] of a failed refresh. The cached key set is left untouched.
    pub async fn ensure_fresh(&self) -> Result<(), FetchError> {
        if self.is_fresh() {
            return Ok(());
        }

        let failures_seen = self.failed_refreshes.load(Ordering::SeqCst);
        let mut last_failure = self.refresh.lock().await;

        // Someone else may have refreshed while we waited.
        if self.is_fresh() {
            tracing::debug!("JWKS refreshed by a concurrent caller");
            return Ok(());
        }

        // Or tried and failed.
        if self.failed_refreshes.load(Ordering::SeqCst) != failures_seen {
            let reason = last_failure.clone().unwrap_or_default();
            return Err(FetchError::ConcurrentRefreshFailed { reason });
        }

        tracing::debug!("Refreshing JWKS");
        match self.fetcher.fetch().await {
            Ok(jwks) => {
                let key_set = KeySet::from_jwks(&jwks, Instant::now());
                tracing::info!(key_count = key_set.len(), "JWKS refreshed");
                self.snapshot.store(Arc::new(key_set));
                *last_failure = None;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to refresh JWKS");
                *last_failure = Some(err.to_string());
                self.failed_refreshes.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// The most recently fetched key set. Never triggers a fetch.
    pub fn current_snapshot(&self) -> Arc<KeySet> {
        self.snapshot.load_full()
    }

    /// How long a fetched key set is considered fresh.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn is_fresh(&self) -> bool {
        self.snapshot.load().fetched_at.elapsed() < self.poll_interval
    }
}
