use std::{fmt, future::Future, pin::Pin, sync::Arc};

use aliri_oidc::{authenticate, AuthenticationError, Authenticator, ValidateOptions, VerifyOptions};
use http::{Request, Response};
use tower_http::auth::{AsyncAuthorizeRequest, AsyncRequireAuthorizationLayer};
use tracing::Instrument;

use crate::{
    context,
    extract::{FromAuthorizationHeader, RequestHead, TokenExtractor, TokenNotFound},
    JsonErrorHandler,
};

/// Handler for responding to requests that could not be authenticated
pub trait OnAuthError {
    /// The body type returned on an error
    type Body;

    /// Response when no token was found in the request
    fn on_missing_token(&self, error: &TokenNotFound) -> Response<Self::Body>;

    /// Response when the token was found but rejected
    fn on_rejected(&self, error: &AuthenticationError) -> Response<Self::Body>;
}

macro_rules! delegate_impls {
    ($($ty:ty)*) => {
        $(
            impl<T> OnAuthError for $ty
            where
                T: OnAuthError,
            {
                type Body = T::Body;

                fn on_missing_token(&self, error: &TokenNotFound) -> Response<Self::Body> {
                    T::on_missing_token(self, error)
                }

                fn on_rejected(&self, error: &AuthenticationError) -> Response<Self::Body> {
                    T::on_rejected(self, error)
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

#[derive(Clone)]
struct GateConfig {
    extractor: Arc<dyn TokenExtractor>,
    verify: VerifyOptions,
    validate: ValidateOptions,
}

impl fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GateConfig")
            .field("verify", &self.verify)
            .field("validate", &self.validate)
            .finish_non_exhaustive()
    }
}

/// Settings that replace the gate's own for a single layer
///
/// Anything left unset falls back to the gate's setting.
#[derive(Clone, Default)]
#[must_use]
pub struct AuthenticateOverrides {
    extractor: Option<Arc<dyn TokenExtractor>>,
    verify: Option<VerifyOptions>,
    validate: Option<ValidateOptions>,
}

impl AuthenticateOverrides {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Locates the token differently
    pub fn with_extractor<E>(self, extractor: E) -> Self
    where
        E: TokenExtractor + 'static,
    {
        Self {
            extractor: Some(Arc::new(extractor)),
            ..self
        }
    }

    /// Verifies signatures differently
    pub fn with_verify_options(self, verify: VerifyOptions) -> Self {
        Self {
            verify: Some(verify),
            ..self
        }
    }

    /// Validates claims differently
    pub fn with_validate_options(self, validate: ValidateOptions) -> Self {
        Self {
            validate: Some(validate),
            ..self
        }
    }
}

impl fmt::Debug for AuthenticateOverrides {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthenticateOverrides")
            .field("extractor", &self.extractor.is_some())
            .field("verify", &self.verify)
            .field("validate", &self.validate)
            .finish()
    }
}

/// Builder for layers that require an authenticated bearer token
///
/// Requests without a token, or with a token that fails verification, are
/// answered by the error handler and never reach the inner service. Accepted
/// requests carry the [`Token`][aliri_oidc::Token] in their extensions,
/// retrievable with [`token_from`][crate::token_from].
///
/// ```
/// use aliri::jwt;
/// use aliri_oidc::{KeyResolver, ValidateOptions, VerifyOptions};
/// use aliri_tower::{AuthenticationGate, FirstOf, FromAuthorizationHeader, FromQuery, JsonErrorHandler};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let gate = AuthenticationGate::new(
///     VerifyOptions::new(KeyResolver::new("login.example.com")?),
///     ValidateOptions::new().add_allowed_audience(jwt::Audience::from_static("https://api.example.com")),
/// )
/// .with_extractor(
///     FirstOf::new()
///         .or(FromAuthorizationHeader)
///         .or(FromQuery::new("access_token")),
/// )
/// .with_error_handler(JsonErrorHandler::<String>::new());
///
/// let layer = gate.layer();
/// # let _ = layer;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
#[must_use]
pub struct AuthenticationGate<OnError = JsonErrorHandler> {
    config: GateConfig,
    on_error: OnError,
}

impl AuthenticationGate {
    /// Constructs a gate reading `Authorization: Bearer` tokens and
    /// responding to failures with a JSON body
    pub fn new(verify: VerifyOptions, validate: ValidateOptions) -> Self {
        Self {
            config: GateConfig {
                extractor: Arc::new(FromAuthorizationHeader),
                verify,
                validate,
            },
            on_error: JsonErrorHandler::new(),
        }
    }

    /// Constructs a gate using the options of an existing authenticator
    pub fn from_authenticator(authenticator: &Authenticator) -> Self {
        Self::new(
            authenticator.verify_options().clone(),
            authenticator.validate_options().clone(),
        )
    }
}

impl<OnError> AuthenticationGate<OnError> {
    /// Locates tokens with the given extractor
    pub fn with_extractor<E>(self, extractor: E) -> Self
    where
        E: TokenExtractor + 'static,
    {
        Self {
            config: GateConfig {
                extractor: Arc::new(extractor),
                ..self.config
            },
            ..self
        }
    }

    /// Attaches a custom error handler to generate responses
    /// in the event of an authentication failure
    pub fn with_error_handler<E>(self, on_error: E) -> AuthenticationGate<E> {
        AuthenticationGate {
            config: self.config,
            on_error,
        }
    }
}

impl<OnError: Clone> AuthenticationGate<OnError> {
    /// The request authorizer applying the gate's settings
    pub fn authorizer(&self) -> Authenticate<OnError> {
        self.authorizer_with(AuthenticateOverrides::default())
    }

    /// The request authorizer applying the gate's settings, with some
    /// replaced
    ///
    /// The gate itself is left unchanged.
    pub fn authorizer_with(&self, overrides: AuthenticateOverrides) -> Authenticate<OnError> {
        let base = &self.config;
        let config = GateConfig {
            extractor: overrides
                .extractor
                .unwrap_or_else(|| Arc::clone(&base.extractor)),
            verify: overrides.verify.unwrap_or_else(|| base.verify.clone()),
            validate: overrides.validate.unwrap_or_else(|| base.validate.clone()),
        };

        Authenticate {
            config: Arc::new(config),
            on_error: self.on_error.clone(),
        }
    }

    /// A layer applying the gate's settings
    pub fn layer(&self) -> AsyncRequireAuthorizationLayer<Authenticate<OnError>> {
        AsyncRequireAuthorizationLayer::new(self.authorizer())
    }

    /// A layer applying the gate's settings, with some replaced
    ///
    /// The gate itself is left unchanged.
    pub fn layer_with(
        &self,
        overrides: AuthenticateOverrides,
    ) -> AsyncRequireAuthorizationLayer<Authenticate<OnError>> {
        AsyncRequireAuthorizationLayer::new(self.authorizer_with(overrides))
    }
}

impl<OnError> fmt::Debug for AuthenticationGate<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthenticationGate")
            .field("config", &self.config)
            .field("on_error", &self.on_error)
            .finish()
    }
}

/// Authenticates requests for [`AsyncRequireAuthorizationLayer`]
///
/// Produced by [`AuthenticationGate::authorizer`].
pub struct Authenticate<OnError> {
    config: Arc<GateConfig>,
    on_error: OnError,
}

impl<OnError> Clone for Authenticate<OnError>
where
    OnError: Clone,
{
    #[inline]
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            on_error: self.on_error.clone(),
        }
    }
}

impl<OnError> fmt::Debug for Authenticate<OnError>
where
    OnError: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Authenticate")
            .field("config", &self.config)
            .field("on_error", &self.on_error)
            .finish()
    }
}

impl<B, OnError> AsyncAuthorizeRequest<B> for Authenticate<OnError>
where
    B: Send + 'static,
    OnError: OnAuthError + Clone + Send + Sync + 'static,
    OnError::Body: Send + 'static,
{
    type RequestBody = B;
    type ResponseBody = OnError::Body;
    type Future = Pin<
        Box<dyn Future<Output = Result<Request<B>, Response<OnError::Body>>> + Send + 'static>,
    >;

    fn authorize(&mut self, mut request: Request<B>) -> Self::Future {
        let config = Arc::clone(&self.config);
        let on_error = self.on_error.clone();

        let span = tracing::debug_span!(
            "authenticate_request",
            http.method = %request.method(),
            http.path = request.uri().path(),
        );

        Box::pin(
            async move {
                let jwt = match config.extractor.extract(RequestHead::from(&request)) {
                    Ok(jwt) => jwt,
                    Err(err) => {
                        tracing::debug!("authentication failed: {err}");
                        return Err(on_error.on_missing_token(&err));
                    }
                };

                match authenticate(&jwt, &config.verify, &config.validate).await {
                    Ok(token) => {
                        tracing::trace!("token accepted");
                        context::with_token(request.extensions_mut(), Arc::new(token));
                        Ok(request)
                    }
                    Err(err) => {
                        tracing::debug!(
                            stage = ?err.stage(),
                            upstream = err.is_upstream_failure(),
                            "authentication failed: {err}",
                        );
                        Err(on_error.on_rejected(&err))
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use aliri::jwt;
    use color_eyre::Result;
    use http::{header, StatusCode};
    use tower::{ServiceBuilder, ServiceExt};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        test::{
            hmac_key_with_id, jwt_for, jwt_signed_with, validate_options, verify_options, AUDIENCE,
        },
        token_from, FromQuery,
    };

    fn gate() -> AuthenticationGate<JsonErrorHandler<String>> {
        AuthenticationGate::new(verify_options(), validate_options())
            .with_error_handler(JsonErrorHandler::new())
    }

    async fn call(
        layer: AsyncRequireAuthorizationLayer<Authenticate<JsonErrorHandler<String>>>,
        request: Request<String>,
    ) -> Result<(Response<String>, usize)> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let svc = ServiceBuilder::new()
            .layer(layer)
            .service_fn(move |req: Request<String>| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let subject = token_from(req.extensions())
                        .and_then(|t| t.subject().map(|s| s.as_str().to_owned()))
                        .unwrap_or_default();
                    Ok::<_, Infallible>(Response::new(subject))
                }
            });

        let resp = svc.oneshot(request).await?;
        Ok((resp, calls.load(Ordering::SeqCst)))
    }

    fn bearer(token: &str) -> Request<String> {
        Request::builder()
            .uri("/widgets")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(String::new())
            .unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_token_is_rejected_before_downstream() -> Result<()> {
        let request = Request::builder().uri("/widgets").body(String::new())?;
        let (resp, calls) = call(gate().layer(), request).await?;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.body(), r#"{"error":"token not found"}"#);
        assert_eq!(
            resp.headers()[header::WWW_AUTHENTICATE],
            r#"Bearer error="invalid_token""#
        );
        assert_eq!(calls, 0);
        assert!(logs_contain("authentication failed: token not found"));
        Ok(())
    }

    #[tokio::test]
    async fn valid_token_reaches_downstream_with_token_attached() -> Result<()> {
        let jwt = jwt_for(AUDIENCE, &["read"]);
        let (resp, calls) = call(gate().layer(), bearer(jwt.as_str())).await?;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "user-1");
        assert_eq!(calls, 1);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_audience_is_unauthorized() -> Result<()> {
        let jwt = jwt_for("https://elsewhere.example.com", &["read"]);
        let (resp, calls) = call(gate().layer(), bearer(jwt.as_str())).await?;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls, 0);

        let body: serde_json::Value = serde_json::from_str(resp.body())?;
        assert_eq!(body["error"], "claims invalid: invalid audience");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kid_is_a_generic_signature_failure() -> Result<()> {
        let stranger = hmac_key_with_id("unpublished-key", b"a-secret-nobody-published");
        let jwt = jwt_signed_with(&stranger, "unpublished-key", AUDIENCE, &["read"]);

        let (resp, calls) = call(gate().layer(), bearer(jwt.as_str())).await?;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.body(),
            r#"{"error":"signature invalid: no matching key found to validate JWT"}"#
        );
        assert_eq!(calls, 0);
        Ok(())
    }

    #[tokio::test]
    async fn garbage_token_is_unauthorized() -> Result<()> {
        let (resp, calls) = call(gate().layer(), bearer("garbage")).await?;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls, 0);

        let body: serde_json::Value = serde_json::from_str(resp.body())?;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("signature invalid"));
        Ok(())
    }

    #[tokio::test]
    async fn terse_handler_hides_details() -> Result<()> {
        let gate = gate().with_error_handler(JsonErrorHandler::<String>::terse());
        let jwt = jwt_for("https://elsewhere.example.com", &["read"]);
        let (resp, _) = call(gate.layer(), bearer(jwt.as_str())).await?;

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.body(), r#"{"error":"unauthenticated"}"#);
        Ok(())
    }

    #[tokio::test]
    async fn overrides_apply_without_changing_gate() -> Result<()> {
        let gate = gate();
        let strict = gate.layer_with(
            AuthenticateOverrides::new().with_validate_options(
                ValidateOptions::new()
                    .add_allowed_audience(jwt::Audience::from_static("https://other.example.com")),
            ),
        );

        let jwt = jwt_for(AUDIENCE, &["read"]);

        let (resp, _) = call(strict, bearer(jwt.as_str())).await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (resp, _) = call(gate.layer(), bearer(jwt.as_str())).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn extractor_override_reads_query() -> Result<()> {
        let gate = gate();
        let layer =
            gate.layer_with(AuthenticateOverrides::new().with_extractor(FromQuery::new("token")));

        let jwt = jwt_for(AUDIENCE, &[]);
        let request = Request::builder()
            .uri(format!("/widgets?token={}", jwt.as_str()))
            .body(String::new())?;

        let (resp, calls) = call(layer, request).await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(calls, 1);

        let request = Request::builder()
            .uri(format!("/widgets?token={}", jwt.as_str()))
            .body(String::new())?;

        let (resp, _) = call(gate.layer(), request).await?;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
