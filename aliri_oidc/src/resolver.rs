//! Verification keys resolved through OpenID Connect discovery

use std::{fmt, sync::Arc, time::Duration};

use aliri::{jwa, jwk, Jwk, Jwks};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The default path of the discovery document, relative to the issuer
pub const DEFAULT_DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Every algorithm this build is able to verify, in order of preference
const SUPPORTED_ALGORITHMS: &[jwa::Algorithm] = &[
    #[cfg(feature = "rsa")]
    jwa::Algorithm::RS256,
    #[cfg(feature = "rsa")]
    jwa::Algorithm::RS384,
    #[cfg(feature = "rsa")]
    jwa::Algorithm::RS512,
    #[cfg(feature = "rsa")]
    jwa::Algorithm::PS256,
    #[cfg(feature = "rsa")]
    jwa::Algorithm::PS384,
    #[cfg(feature = "rsa")]
    jwa::Algorithm::PS512,
    #[cfg(feature = "ec")]
    jwa::Algorithm::ES256,
    #[cfg(feature = "ec")]
    jwa::Algorithm::ES384,
    #[cfg(feature = "ec")]
    jwa::Algorithm::ES512,
    #[cfg(feature = "hmac")]
    jwa::Algorithm::HS256,
    #[cfg(feature = "hmac")]
    jwa::Algorithm::HS384,
    #[cfg(feature = "hmac")]
    jwa::Algorithm::HS512,
];

/// A failure while retrieving a document from the issuer
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request could not be sent, timed out, or returned a non-success status
    #[error("request to issuer failed")]
    Request(#[from] reqwest::Error),
    /// The key set document could not be read
    #[error("malformed key set")]
    MalformedKeySet(#[source] serde_json::Error),
}

/// An error while resolving a verification key
#[derive(Debug, Error)]
pub enum KeyResolutionError {
    /// The issuer domain was empty
    #[error("issuer domain is empty")]
    EmptyIssuer,
    /// The key ID to look up was empty
    #[error("kid is empty")]
    EmptyKeyId,
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    HttpClient(#[source] reqwest::Error),
    /// A document could not be retrieved from the issuer
    #[error("unable to fetch {url}")]
    UpstreamFetchFailed {
        /// The address that was requested
        url: String,
        /// The underlying failure
        #[source]
        source: FetchError,
    },
    /// The discovery document was not valid JSON
    #[error("malformed discovery document at {url}")]
    MalformedDiscoveryDocument {
        /// The address of the discovery document
        url: String,
        /// The underlying parse failure
        #[source]
        source: serde_json::Error,
    },
    /// The discovery document did not name a key set
    #[error("discovery document at {url} has no jwks_uri")]
    MissingKeySetLocation {
        /// The address of the discovery document
        url: String,
    },
    /// The key set holds no key with the requested ID
    #[error("key for {0:?} not found")]
    KeyNotFound(jwk::KeyId),
}

impl KeyResolutionError {
    /// Whether the failure came from talking to the issuer
    #[must_use]
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamFetchFailed { .. }
                | Self::MalformedDiscoveryDocument { .. }
                | Self::MissingKeySetLocation { .. }
        )
    }
}

/// What to do when the key set holds no key with the requested ID
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    /// Log the miss and resolve no key, leaving the rejection to the verifier
    #[default]
    Defer,
    /// Fail resolution with [`KeyResolutionError::KeyNotFound`]
    Reject,
}

/// A key able to verify a token, together with the algorithm to verify with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedKey {
    key: Jwk,
    algorithm: jwa::Algorithm,
}

impl ResolvedKey {
    /// The verification key
    #[must_use]
    pub fn key(&self) -> &Jwk {
        &self.key
    }

    /// The algorithm the key will verify with
    #[must_use]
    pub fn algorithm(&self) -> jwa::Algorithm {
        self.algorithm
    }

    /// Splits into the key and algorithm
    #[must_use]
    pub fn into_parts(self) -> (Jwk, jwa::Algorithm) {
        (self.key, self.algorithm)
    }
}

/// A source of verification keys
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Looks up the key named by `kid` that can verify `declared_alg`
    ///
    /// When `declared_alg` is `None`, the first algorithm compatible with the
    /// key is used. `Ok(None)` means no usable key was found.
    async fn resolve_key(
        &self,
        kid: &jwk::KeyIdRef,
        declared_alg: Option<jwa::Algorithm>,
    ) -> Result<Option<ResolvedKey>, KeyResolutionError>;
}

#[async_trait]
impl<T> KeySource for Arc<T>
where
    T: KeySource + ?Sized,
{
    #[inline]
    async fn resolve_key(
        &self,
        kid: &jwk::KeyIdRef,
        declared_alg: Option<jwa::Algorithm>,
    ) -> Result<Option<ResolvedKey>, KeyResolutionError> {
        T::resolve_key(self, kid, declared_alg).await
    }
}

/// A fixed key set, resolved without any network access
#[async_trait]
impl KeySource for Jwks {
    async fn resolve_key(
        &self,
        kid: &jwk::KeyIdRef,
        declared_alg: Option<jwa::Algorithm>,
    ) -> Result<Option<ResolvedKey>, KeyResolutionError> {
        if kid.as_str().is_empty() {
            return Err(KeyResolutionError::EmptyKeyId);
        }

        Ok(select_key(self, kid, declared_alg))
    }
}

/// The algorithms a key can be used to verify
///
/// A key that declares its own algorithm supports only that one. Otherwise,
/// every supported algorithm the key material is compatible with is
/// returned. Keys meant for encryption support none.
#[must_use]
pub fn compatible_algorithms(key: &Jwk) -> Vec<jwa::Algorithm> {
    if key.usage() == Some(jwa::Usage::Encryption) {
        return Vec::new();
    }

    match key.algorithm() {
        Some(alg) if key.is_compatible(alg) && alg.to_usage() == jwa::Usage::Signing => vec![alg],
        Some(_) => Vec::new(),
        None => SUPPORTED_ALGORITHMS
            .iter()
            .copied()
            .filter(|&alg| key.is_compatible(alg))
            .collect(),
    }
}

fn choose_algorithm(key: &Jwk, declared_alg: Option<jwa::Algorithm>) -> Option<jwa::Algorithm> {
    let compatible = compatible_algorithms(key);
    match declared_alg {
        Some(alg) => compatible.into_iter().find(|&c| c == alg),
        None => compatible.into_iter().next(),
    }
}

fn select_key(
    jwks: &Jwks,
    kid: &jwk::KeyIdRef,
    declared_alg: Option<jwa::Algorithm>,
) -> Option<ResolvedKey> {
    jwks.keys()
        .iter()
        .filter(|k| k.key_id() == Some(kid))
        .find_map(|k| {
            choose_algorithm(k, declared_alg).map(|algorithm| ResolvedKey {
                key: k.clone(),
                algorithm,
            })
        })
}

fn contains_key_id(jwks: &Jwks, kid: &jwk::KeyIdRef) -> bool {
    jwks.keys().iter().any(|k| k.key_id() == Some(kid))
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    #[serde(default)]
    jwks_uri: Option<String>,
}

struct Inner {
    issuer: String,
    discovery_url: String,
    missing_key_policy: MissingKeyPolicy,
    client: Client,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyResolver")
            .field("issuer", &self.issuer)
            .field("discovery_url", &self.discovery_url)
            .field("missing_key_policy", &self.missing_key_policy)
            .finish_non_exhaustive()
    }
}

/// Resolves verification keys from an OpenID Connect issuer
///
/// Each resolution reads the issuer's discovery document, follows its
/// `jwks_uri`, and picks the key with the requested ID out of the fetched key
/// set. Nothing is cached between calls.
///
/// The resolver is cheap to clone and may be shared between tasks.
///
/// ```no_run
/// use aliri::{jwa, jwk};
/// use aliri_oidc::KeyResolver;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let resolver = KeyResolver::new("login.example.com")?;
///
/// let kid = jwk::KeyId::from_static("signing-key-1");
/// if let Some(key) = resolver.resolve_key(&kid, Some(jwa::Algorithm::RS256)).await? {
///     println!("verify with {}", key.algorithm());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
#[must_use]
pub struct KeyResolver {
    inner: Arc<Inner>,
}

/// Configuration for a [`KeyResolver`]
#[derive(Debug)]
#[must_use]
pub struct KeyResolverBuilder {
    issuer: String,
    discovery_path: String,
    missing_key_policy: MissingKeyPolicy,
    timeout: Option<Duration>,
    client: Option<Client>,
}

impl KeyResolverBuilder {
    /// Overrides the path of the discovery document
    pub fn with_discovery_path(self, path: impl Into<String>) -> Self {
        Self {
            discovery_path: path.into(),
            ..self
        }
    }

    /// Sets the behavior when no key matches the requested ID
    pub fn with_missing_key_policy(self, policy: MissingKeyPolicy) -> Self {
        Self {
            missing_key_policy: policy,
            ..self
        }
    }

    /// Bounds each request made to the issuer
    ///
    /// Ignored if a client is provided with [`with_client`][Self::with_client].
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Uses an existing HTTP client
    pub fn with_client(self, client: Client) -> Self {
        Self {
            client: Some(client),
            ..self
        }
    }

    /// Constructs the resolver
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer is empty or the HTTP client cannot be
    /// constructed.
    pub fn build(self) -> Result<KeyResolver, KeyResolutionError> {
        let issuer = self.issuer.trim();
        if issuer.is_empty() {
            return Err(KeyResolutionError::EmptyIssuer);
        }

        let discovery_url = discovery_url(issuer, &self.discovery_path);

        let client = match self.client {
            Some(client) => client,
            None => {
                let mut builder =
                    Client::builder().user_agent(concat!("aliri_oidc/", env!("CARGO_PKG_VERSION")));
                if let Some(timeout) = self.timeout {
                    builder = builder.timeout(timeout);
                }
                builder.build().map_err(KeyResolutionError::HttpClient)?
            }
        };

        tracing::debug!(oidc.issuer = issuer, %discovery_url, "constructed key resolver");

        Ok(KeyResolver {
            inner: Arc::new(Inner {
                issuer: issuer.to_owned(),
                discovery_url,
                missing_key_policy: self.missing_key_policy,
                client,
            }),
        })
    }
}

/// Issuers without a scheme are addressed over HTTPS
fn discovery_url(issuer: &str, path: &str) -> String {
    let origin = issuer.trim_end_matches('/');
    let path = path.trim_start_matches('/');

    if origin.starts_with("https://") || origin.starts_with("http://") {
        format!("{origin}/{path}")
    } else {
        format!("https://{origin}/{path}")
    }
}

impl KeyResolver {
    /// Starts configuring a resolver for the given issuer
    ///
    /// The issuer may be a bare domain, such as `login.example.com`, or an
    /// origin with an explicit scheme.
    pub fn builder(issuer: impl Into<String>) -> KeyResolverBuilder {
        KeyResolverBuilder {
            issuer: issuer.into(),
            discovery_path: DEFAULT_DISCOVERY_PATH.to_owned(),
            missing_key_policy: MissingKeyPolicy::default(),
            timeout: None,
            client: None,
        }
    }

    /// Constructs a resolver for the given issuer with default settings
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer is empty or the HTTP client cannot be
    /// constructed.
    pub fn new(issuer: impl Into<String>) -> Result<Self, KeyResolutionError> {
        Self::builder(issuer).build()
    }

    /// The configured issuer
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    /// The address of the issuer's discovery document
    #[must_use]
    pub fn discovery_url(&self) -> &str {
        &self.inner.discovery_url
    }

    /// The behavior when no key matches the requested ID
    #[must_use]
    pub fn missing_key_policy(&self) -> MissingKeyPolicy {
        self.inner.missing_key_policy
    }

    /// Fetches the issuer's current key set and looks up the key named by `kid`
    ///
    /// # Errors
    ///
    /// Returns an error if `kid` is empty, if either document cannot be
    /// retrieved or parsed, or if no key matches `kid` and the resolver is
    /// configured with [`MissingKeyPolicy::Reject`].
    #[tracing::instrument(
        skip(self),
        fields(
            oidc.issuer = %self.inner.issuer,
            jwk.kid = %kid,
            jwk.alg = tracing::field::Empty,
            jwk.found = tracing::field::Empty,
        ),
    )]
    pub async fn resolve_key(
        &self,
        kid: &jwk::KeyIdRef,
        declared_alg: Option<jwa::Algorithm>,
    ) -> Result<Option<ResolvedKey>, KeyResolutionError> {
        if kid.as_str().is_empty() {
            return Err(KeyResolutionError::EmptyKeyId);
        }

        if let Some(alg) = declared_alg {
            tracing::Span::current().record("jwk.alg", tracing::field::display(alg));
        }

        let jwks_uri = self.fetch_jwks_uri().await?;
        let jwks = self.fetch_jwks(&jwks_uri).await?;

        let span = tracing::Span::current();
        if !contains_key_id(&jwks, kid) {
            span.record("jwk.found", false);
            tracing::warn!(keys = jwks.keys().len(), "no key in issuer key set matches kid");

            return match self.inner.missing_key_policy {
                MissingKeyPolicy::Defer => Ok(None),
                MissingKeyPolicy::Reject => Err(KeyResolutionError::KeyNotFound(kid.to_owned())),
            };
        }

        span.record("jwk.found", true);

        let resolved = select_key(&jwks, kid, declared_alg);
        match &resolved {
            Some(key) => tracing::debug!(alg = %key.algorithm, "resolved verification key"),
            None => tracing::debug!("key found but no compatible algorithm"),
        }

        Ok(resolved)
    }

    #[tracing::instrument(skip(self), fields(http.url = %self.inner.discovery_url))]
    async fn fetch_jwks_uri(&self) -> Result<String, KeyResolutionError> {
        let url = &self.inner.discovery_url;
        let body = self.get(url).await?;

        let document: DiscoveryDocument = serde_json::from_slice(&body).map_err(|source| {
            KeyResolutionError::MalformedDiscoveryDocument {
                url: url.clone(),
                source,
            }
        })?;

        match document.jwks_uri {
            Some(jwks_uri) if !jwks_uri.trim().is_empty() => {
                tracing::trace!(%jwks_uri, "discovered key set location");
                Ok(jwks_uri)
            }
            _ => Err(KeyResolutionError::MissingKeySetLocation { url: url.clone() }),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<Jwks, KeyResolutionError> {
        let body = self.get(jwks_uri).await?;

        serde_json::from_slice(&body).map_err(|err| KeyResolutionError::UpstreamFetchFailed {
            url: jwks_uri.to_owned(),
            source: FetchError::MalformedKeySet(err),
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, KeyResolutionError> {
        let upstream = |err: reqwest::Error| KeyResolutionError::UpstreamFetchFailed {
            url: url.to_owned(),
            source: FetchError::Request(err),
        };

        let response = self.inner.client.get(url).send().await.map_err(upstream)?;

        tracing::debug!(http.status_code = response.status().as_u16(), "received response from issuer");

        if let Err(err) = response.error_for_status_ref() {
            let error: &dyn std::error::Error = &err;
            tracing::warn!(error, "unexpected response status from issuer");
            return Err(upstream(err));
        }

        let body = response.bytes().await.map_err(upstream)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl KeySource for KeyResolver {
    #[inline]
    async fn resolve_key(
        &self,
        kid: &jwk::KeyIdRef,
        declared_alg: Option<jwa::Algorithm>,
    ) -> Result<Option<ResolvedKey>, KeyResolutionError> {
        KeyResolver::resolve_key(self, kid, declared_alg).await
    }
}
