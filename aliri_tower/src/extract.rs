//! Locating the bearer token in an inbound request

use std::{borrow::Cow, fmt, sync::Arc};

use aliri::Jwt;
use http::{header, HeaderMap, HeaderName, Request, Uri};
use thiserror::Error;

/// No token could be found in the request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Error)]
#[error("token not found")]
pub struct TokenNotFound;

/// The parts of a request that a token may be read from
#[derive(Clone, Copy, Debug)]
pub struct RequestHead<'a> {
    headers: &'a HeaderMap,
    uri: &'a Uri,
}

impl<'a> RequestHead<'a> {
    /// Constructs a view over request headers and URI
    #[inline]
    pub fn new(headers: &'a HeaderMap, uri: &'a Uri) -> Self {
        Self { headers, uri }
    }

    /// The request headers
    #[inline]
    pub fn headers(&self) -> &'a HeaderMap {
        self.headers
    }

    /// The request URI
    #[inline]
    pub fn uri(&self) -> &'a Uri {
        self.uri
    }
}

impl<'a, B> From<&'a Request<B>> for RequestHead<'a> {
    #[inline]
    fn from(request: &'a Request<B>) -> Self {
        Self::new(request.headers(), request.uri())
    }
}

/// Reads a bearer token out of a request
///
/// Extraction has no side effects. Implementations report a missing, empty,
/// or unreadable token as [`TokenNotFound`].
pub trait TokenExtractor: Send + Sync {
    /// Locates the token
    ///
    /// # Errors
    ///
    /// Returns [`TokenNotFound`] if the request carries no usable token.
    fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> TokenExtractor for $ty
            where
                T: TokenExtractor + ?Sized,
            {
                #[inline]
                fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound> {
                    T::extract(self, request)
                }
            }
        )*
    }
}

delegate_impls!(
    &'_ T
    Box<T>
    Arc<T>
);

fn non_empty(value: &str) -> Result<Jwt, TokenNotFound> {
    let value = value.trim();
    if value.is_empty() {
        Err(TokenNotFound)
    } else {
        Ok(Jwt::from(value))
    }
}

/// Reads the token from an `Authorization: Bearer <token>` header
///
/// The `Bearer` scheme is matched without regard to case.
#[derive(Clone, Copy, Debug, Default)]
pub struct FromAuthorizationHeader;

impl TokenExtractor for FromAuthorizationHeader {
    fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound> {
        let auth = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(TokenNotFound)?
            .trim_start();

        if auth.len() < 7 || !auth[..7].eq_ignore_ascii_case("bearer ") {
            return Err(TokenNotFound);
        }

        non_empty(&auth[7..])
    }
}

/// Reads the raw value of a named header as the token
#[derive(Clone, Debug)]
pub struct FromHeader {
    name: HeaderName,
}

impl FromHeader {
    /// Reads the token from the header with the given name
    #[inline]
    pub fn new(name: HeaderName) -> Self {
        Self { name }
    }

    /// Reads the token from the header with the given static name
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a valid lowercase header name.
    #[inline]
    pub fn from_static(name: &'static str) -> Self {
        Self::new(HeaderName::from_static(name))
    }
}

impl TokenExtractor for FromHeader {
    fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound> {
        let value = request
            .headers()
            .get(&self.name)
            .and_then(|v| v.to_str().ok())
            .ok_or(TokenNotFound)?;

        non_empty(value)
    }
}

/// Reads the token from a named, URL-encoded query parameter
#[derive(Clone, Debug)]
pub struct FromQuery {
    name: Cow<'static, str>,
}

impl FromQuery {
    /// Reads the token from the query parameter with the given name
    #[inline]
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into() }
    }
}

impl TokenExtractor for FromQuery {
    fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound> {
        let query = request.uri().query().ok_or(TokenNotFound)?;

        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == &self.name)
            .ok_or(TokenNotFound)
            .and_then(|(_, value)| non_empty(&value))
    }
}

/// Tries each extractor in order, returning the first token found
///
/// ```
/// use aliri_tower::{FirstOf, FromAuthorizationHeader, FromQuery};
///
/// let extractor = FirstOf::new()
///     .or(FromAuthorizationHeader)
///     .or(FromQuery::new("access_token"));
/// ```
#[derive(Clone, Default)]
pub struct FirstOf {
    extractors: Vec<Arc<dyn TokenExtractor>>,
}

impl FirstOf {
    /// An empty chain, which never finds a token
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an extractor to the chain
    pub fn or<E>(mut self, extractor: E) -> Self
    where
        E: TokenExtractor + 'static,
    {
        self.extractors.push(Arc::new(extractor));
        self
    }

    /// The number of extractors in the chain
    #[inline]
    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    /// Whether the chain holds no extractors
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

impl fmt::Debug for FirstOf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FirstOf")
            .field("extractors", &self.extractors.len())
            .finish()
    }
}

impl TokenExtractor for FirstOf {
    fn extract(&self, request: RequestHead<'_>) -> Result<Jwt, TokenNotFound> {
        self.extractors
            .iter()
            .find_map(|e| e.extract(request).ok())
            .ok_or(TokenNotFound)
    }
}
