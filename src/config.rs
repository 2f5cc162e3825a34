use std::time::Duration;

use axum::http::header::WWW_AUTHENTICATE;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use derive_builder::Builder;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::Error;

/// Minimum time between two successful JWKS fetches.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound for a single JWKS request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the OAuth protected resource metadata document is served by default.
pub const DEFAULT_METADATA_PATH: &str = "/.well-known/oauth-protected-resource";

const DEFAULT_HEADER_NAME: &str = "Authorization";
const DEFAULT_HEADER_PREFIX: &str = "Bearer ";

/// Where to look for the token in a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LocationRule {
    /// A request header, optionally required to start with `value_prefix`.
    Header {
        name: String,
        #[serde(default)]
        value_prefix: Option<String>,
    },
    /// A cookie from the `Cookie` header.
    Cookie { name: String },
}

impl LocationRule {
    pub fn header(name: impl Into<String>, value_prefix: Option<&str>) -> Self {
        Self::Header {
            name: name.into(),
            value_prefix: value_prefix.map(str::to_owned),
        }
    }

    pub fn cookie(name: impl Into<String>) -> Self {
        Self::Cookie { name: name.into() }
    }

    /// `Authorization: Bearer <token>`, used when no location is configured.
    pub fn bearer() -> Self {
        Self::header(DEFAULT_HEADER_NAME, Some(DEFAULT_HEADER_PREFIX))
    }

    fn defaults() -> Vec<Self> {
        vec![Self::bearer()]
    }
}

/// A header attached to every rejection, e.g. `WWW-Authenticate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnauthenticatedHeader {
    pub name: String,
    pub value: String,
}

/// OAuth 2.0 protected resource metadata (RFC 9728) published next to the protected routes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtectedResource {
    /// Path the metadata document is served on
    #[serde(default = "default_metadata_path")]
    pub metadata_path: String,
    pub metadata: ResourceMetadata,
}

/// The metadata document. `resource` is mandatory, any other parameter is passed through.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResourceMetadata {
    pub resource: String,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl ProtectedResource {
    /// Metadata for `resource`, served on [`DEFAULT_METADATA_PATH`].
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            metadata_path: default_metadata_path(),
            metadata: ResourceMetadata {
                resource: resource.into(),
                parameters: Map::new(),
            },
        }
    }

    pub fn with_metadata_path(mut self, path: impl Into<String>) -> Self {
        self.metadata_path = path.into();
        self
    }

    /// Adds a metadata parameter such as `authorization_servers` or `scopes_supported`.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.parameters.insert(name.into(), value.into());
        self
    }

    /// The JSON document to serve. `jwks_uri` defaults to the key set the tokens are checked
    /// against.
    pub fn document(&self, jwks_url: &str) -> Value {
        let mut document = self.metadata.parameters.clone();
        document.insert(
            "resource".to_owned(),
            Value::String(self.metadata.resource.clone()),
        );
        document
            .entry("jwks_uri")
            .or_insert_with(|| Value::String(jwks_url.to_owned()));

        Value::Object(document)
    }

    /// `WWW-Authenticate` challenge pointing clients at the metadata document.
    pub fn challenge(&self) -> String {
        format!("Bearer resource_metadata=\"{}\"", self.metadata_path)
    }
}

fn default_metadata_path() -> String {
    DEFAULT_METADATA_PATH.to_owned()
}

/// Validated configuration of the authentication pipeline.
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "Error"))]
pub struct Config {
    /// The URL of the JWKS document
    #[builder(setter(into))]
    jwks_url: String,
    /// Expected `iss` claim; not checked when unset or empty
    #[builder(default, setter(into, strip_option))]
    issuer: Option<String>,
    /// Expected `aud` claim; not checked when unset or empty
    #[builder(default, setter(into, strip_option))]
    audience: Option<String>,
    /// How long a fetched key set is used before it is fetched again
    #[builder(default = "DEFAULT_POLL_INTERVAL")]
    poll_interval: Duration,
    /// Timeout applied to every JWKS request
    #[builder(default = "DEFAULT_FETCH_TIMEOUT")]
    fetch_timeout: Duration,
    /// Token locations, in evaluation order. Never empty.
    #[builder(default = "LocationRule::defaults()", setter(custom))]
    locations: Vec<LocationRule>,
    /// Headers attached to rejected requests
    #[builder(default, setter(custom))]
    unauthenticated_headers: Vec<UnauthenticatedHeader>,
    /// Protected resource metadata to publish, if any
    #[builder(default, setter(strip_option))]
    protected_resource: Option<ProtectedResource>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Loads the configuration from its JSON representation.
    ///
    /// Durations are given in seconds. When `locations` is absent the `header_name`,
    /// `header_value_prefix` and `cookie_name` shorthands are turned into rules.
    pub fn from_json(raw: &[u8]) -> Result<Self, Error> {
        let raw: RawConfig =
            serde_json::from_slice(raw).map_err(|err| Error::ConfigInvalid(err.to_string()))?;

        let mut builder = Self::builder();
        builder
            .jwks_url(raw.url)
            .poll_interval(Duration::from_secs(raw.poll_interval))
            .fetch_timeout(Duration::from_secs(raw.fetch_timeout));

        if let Some(issuer) = raw.issuer {
            builder.issuer(issuer);
        }
        if let Some(audience) = raw.audience {
            builder.audience(audience);
        }

        match raw.locations {
            Some(locations) => {
                builder.locations(locations);
            }
            None => {
                if let Some(name) = raw.header_name {
                    builder.location(LocationRule::Header {
                        name,
                        value_prefix: raw.header_value_prefix,
                    });
                }
                if let Some(name) = raw.cookie_name {
                    builder.location(LocationRule::Cookie { name });
                }
            }
        }

        for header in raw.unauthenticated_headers {
            builder.unauthenticated_header(header.name, header.value);
        }

        if let Some(oauth) = raw.oauth {
            builder.protected_resource(oauth.protected_resource);
        }

        builder.build()
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref().filter(|issuer| !issuer.is_empty())
    }

    pub fn audience(&self) -> Option<&str> {
        self.audience.as_deref().filter(|audience| !audience.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub fn locations(&self) -> &[LocationRule] {
        &self.locations
    }

    pub fn protected_resource(&self) -> Option<&ProtectedResource> {
        self.protected_resource.as_ref()
    }

    /// The rejection headers as a [`HeaderMap`]. Names and values were checked at build time.
    ///
    /// With protected resource metadata configured, a `WWW-Authenticate` challenge pointing at
    /// the metadata document comes first.
    pub fn unauthenticated_headers(&self) -> HeaderMap {
        let challenge = self.protected_resource.as_ref().and_then(|resource| {
            let value = HeaderValue::try_from(resource.challenge()).ok()?;
            Some((WWW_AUTHENTICATE, value))
        });

        challenge
            .into_iter()
            .chain(self.unauthenticated_headers.iter().filter_map(|header| {
                let name = HeaderName::try_from(header.name.as_str()).ok()?;
                let value = HeaderValue::try_from(header.value.as_str()).ok()?;
                Some((name, value))
            }))
            .collect()
    }
}

impl ConfigBuilder {
    /// Replaces the configured locations. An empty list falls back to the default rule.
    pub fn locations(&mut self, locations: Vec<LocationRule>) -> &mut Self {
        self.locations = (!locations.is_empty()).then_some(locations);
        self
    }

    /// Appends a location after the ones already configured.
    pub fn location(&mut self, rule: LocationRule) -> &mut Self {
        self.locations.get_or_insert_with(Vec::new).push(rule);
        self
    }

    pub fn unauthenticated_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.unauthenticated_headers
            .get_or_insert_with(Vec::new)
            .push(UnauthenticatedHeader {
                name: name.into(),
                value: value.into(),
            });
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if let Some(url) = &self.jwks_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|err| Error::ConfigInvalid(format!("invalid url {url:?}: {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::ConfigInvalid(format!(
                    "unsupported url scheme {:?}",
                    parsed.scheme()
                )));
            }
        }

        for rule in self.locations.iter().flatten() {
            match rule {
                LocationRule::Header { name, .. } => {
                    HeaderName::try_from(name.as_str()).map_err(|_| {
                        Error::ConfigInvalid(format!("invalid header name {name:?}"))
                    })?;
                }
                LocationRule::Cookie { name } if name.is_empty() || name.contains(['=', ';']) => {
                    return Err(Error::ConfigInvalid(format!(
                        "invalid cookie name {name:?}"
                    )));
                }
                LocationRule::Cookie { .. } => {}
            }
        }

        for header in self.unauthenticated_headers.iter().flatten() {
            HeaderName::try_from(header.name.as_str()).map_err(|_| {
                Error::ConfigInvalid(format!("invalid header name {:?}", header.name))
            })?;
            HeaderValue::try_from(header.value.as_str()).map_err(|_| {
                Error::ConfigInvalid(format!("invalid value for header {:?}", header.name))
            })?;
        }

        if let Some(Some(resource)) = &self.protected_resource {
            let path = &resource.metadata_path;
            let is_route = path.starts_with('/')
                && !path.contains(['{', '}'])
                && !path.split('/').any(|segment| segment.starts_with([':', '*']));
            if !is_route {
                return Err(Error::ConfigInvalid(format!(
                    "invalid metadata path {path:?}"
                )));
            }
            HeaderValue::try_from(resource.challenge()).map_err(|_| {
                Error::ConfigInvalid(format!("invalid metadata path {path:?}"))
            })?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOAuth {
    protected_resource: ProtectedResource,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    url: String,
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    fetch_timeout: u64,
    #[serde(default)]
    header_name: Option<String>,
    #[serde(default)]
    header_value_prefix: Option<String>,
    #[serde(default)]
    cookie_name: Option<String>,
    #[serde(default)]
    locations: Option<Vec<LocationRule>>,
    #[serde(default)]
    unauthenticated_headers: Vec<UnauthenticatedHeader>,
    #[serde(default)]
    oauth: Option<RawOAuth>,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT.as_secs()
}
