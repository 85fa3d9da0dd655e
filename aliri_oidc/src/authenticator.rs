//! Token signature verification and claims validation

use std::{error::Error as StdError, fmt, sync::Arc, time::Duration};

use aliri::{
    error::{ClaimsRejected, JwtVerifyError},
    jwa,
    jwt::{self, CoreHeaders as _, HasAlgorithm as _},
    JwtRef,
};
use thiserror::Error;

use crate::{resolver::KeySource, Claims, KeyResolutionError, Token};

/// The stage of authentication at which a token was rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The token could not be decoded or its signature could not be verified
    Signature,
    /// The signature was verified, but the claims were not acceptable
    Claims,
}

/// The token signature could not be verified
#[derive(Debug, Error)]
pub enum SignatureError {
    /// The token was not a well-formed JWT
    #[error("malformed token")]
    Malformed(#[source] JwtVerifyError),
    /// The token header did not name a key
    #[error("token header has no kid")]
    MissingKeyId,
    /// No key able to verify the token was found
    #[error("no matching key found to validate JWT")]
    NoMatchingKey,
    /// The key could not be resolved
    #[error("unable to resolve verification key")]
    KeyResolution(#[from] KeyResolutionError),
    /// The key did not accept the signature
    #[error("signature rejected")]
    Rejected(#[source] JwtVerifyError),
}

/// A token was not accepted
#[derive(Debug, Error)]
pub enum AuthenticationError {
    /// The signature could not be verified
    #[error("signature invalid")]
    SignatureInvalid(#[from] SignatureError),
    /// The claims did not satisfy validation
    #[error("claims invalid")]
    ClaimsInvalid(#[source] ClaimsRejected),
}

impl AuthenticationError {
    /// The stage at which the token was rejected
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::SignatureInvalid(_) => Stage::Signature,
            Self::ClaimsInvalid(_) => Stage::Claims,
        }
    }

    /// Whether the failure was caused by the issuer being unreachable or
    /// serving unusable documents
    #[must_use]
    pub fn is_upstream_failure(&self) -> bool {
        match self {
            Self::SignatureInvalid(SignatureError::KeyResolution(err)) => err.is_upstream_failure(),
            _ => false,
        }
    }
}

impl From<JwtVerifyError> for AuthenticationError {
    fn from(err: JwtVerifyError) -> Self {
        match err {
            JwtVerifyError::ClaimsRejected(rejected) => Self::ClaimsInvalid(rejected),
            err @ (JwtVerifyError::MalformedToken(_)
            | JwtVerifyError::MalformedTokenHeader(_)
            | JwtVerifyError::MalformedTokenPayload(_)
            | JwtVerifyError::MalformedTokenSignature(_)) => {
                Self::SignatureInvalid(SignatureError::Malformed(err))
            }
            err => Self::SignatureInvalid(SignatureError::Rejected(err)),
        }
    }
}

/// How the signature of a token is verified
#[derive(Clone)]
pub struct VerifyOptions {
    keys: Arc<dyn KeySource>,
}

impl VerifyOptions {
    /// Verifies tokens with keys from the given source
    #[must_use]
    pub fn new<K>(keys: K) -> Self
    where
        K: KeySource + 'static,
    {
        Self {
            keys: Arc::new(keys),
        }
    }

    /// Verifies tokens with keys from a shared source
    #[must_use]
    pub fn from_shared(keys: Arc<dyn KeySource>) -> Self {
        Self { keys }
    }

    /// The source of verification keys
    #[must_use]
    pub fn key_source(&self) -> &dyn KeySource {
        &*self.keys
    }
}

impl fmt::Debug for VerifyOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VerifyOptions").finish_non_exhaustive()
    }
}

type Predicate = dyn Fn(&Claims) -> Result<(), Box<dyn StdError + Send + Sync>> + Send + Sync;

/// How the claims of a verified token are validated
///
/// Expiration is checked by default. The remaining checks are opt-in. In
/// particular, the `aud` claim is not checked until an audience is added with
/// [`add_allowed_audience`][Self::add_allowed_audience].
///
/// ```
/// use std::time::Duration;
///
/// use aliri::jwt;
/// use aliri_oidc::ValidateOptions;
///
/// let options = ValidateOptions::new()
///     .add_allowed_audience(jwt::Audience::from_static("https://api.example.com"))
///     .require_issuer(jwt::Issuer::from_static("https://login.example.com/"))
///     .with_leeway(Duration::from_secs(30))
///     .with_predicate(|claims| {
///         if claims.permissions().is_empty() {
///             Err("token grants no permissions")
///         } else {
///             Ok(())
///         }
///     });
/// ```
#[derive(Clone, Default)]
#[must_use]
pub struct ValidateOptions {
    core: jwt::CoreValidator,
    predicates: Vec<Arc<Predicate>>,
}

impl ValidateOptions {
    /// Validates only that the token has not expired
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the registered-claims validator
    pub fn with_core_validator(self, core: jwt::CoreValidator) -> Self {
        Self { core, ..self }
    }

    /// Accepts tokens issued for this audience
    ///
    /// Once any audience is added, tokens must name at least one allowed audience.
    pub fn add_allowed_audience(self, audience: jwt::Audience) -> Self {
        Self {
            core: self.core.add_allowed_audience(audience),
            ..self
        }
    }

    /// Requires the `iss` claim to match
    pub fn require_issuer(self, issuer: jwt::Issuer) -> Self {
        Self {
            core: self.core.require_issuer(issuer),
            ..self
        }
    }

    /// Allows for clock skew when checking time-based claims
    pub fn with_leeway(self, leeway: Duration) -> Self {
        Self {
            core: self.core.with_leeway(leeway),
            ..self
        }
    }

    /// Restricts the accepted signing algorithms
    ///
    /// Once any algorithm is added, tokens signed with other algorithms are
    /// rejected.
    pub fn add_approved_algorithm(self, alg: jwa::Algorithm) -> Self {
        Self {
            core: self.core.add_approved_algorithm(alg),
            ..self
        }
    }

    /// Requires and checks the `nbf` claim
    pub fn check_not_before(self) -> Self {
        Self {
            core: self.core.check_not_before(),
            ..self
        }
    }

    /// Skips the `exp` check
    pub fn ignore_expiration(self) -> Self {
        Self {
            core: self.core.ignore_expiration(),
            ..self
        }
    }

    /// Adds a custom check, run after the registered claims have been validated
    ///
    /// The error returned by the predicate becomes the reason for rejection.
    pub fn with_predicate<F, E>(mut self, predicate: F) -> Self
    where
        F: Fn(&Claims) -> Result<(), E> + Send + Sync + 'static,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.predicates.push(Arc::new(
            move |claims: &Claims| -> Result<(), Box<dyn StdError + Send + Sync>> {
                predicate(claims).map_err(Into::into)
            },
        ));
        self
    }

    /// The registered-claims validator
    pub fn core_validator(&self) -> &jwt::CoreValidator {
        &self.core
    }

    fn predicates(&self) -> Predicates<'_> {
        Predicates(&self.predicates)
    }
}

impl fmt::Debug for ValidateOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ValidateOptions")
            .field("core", &self.core)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

struct Predicates<'a>(&'a [Arc<Predicate>]);

impl jwt::ClaimsValidator<Claims, jwt::BasicHeaders> for Predicates<'_> {
    fn validate(&self, _header: &jwt::BasicHeaders, claims: &Claims) -> Result<(), ClaimsRejected> {
        self.0
            .iter()
            .try_for_each(|predicate| predicate(claims).map_err(ClaimsRejected::Custom))
    }
}

/// Verifies the signature of a token and validates its claims
///
/// The key is resolved using the `kid` and `alg` declared in the token
/// header. The signature is then checked, and the claims are validated.
///
/// # Errors
///
/// Returns [`AuthenticationError::SignatureInvalid`] if the token is
/// malformed, has no `kid`, cannot be matched to a key, or fails signature
/// verification. Returns [`AuthenticationError::ClaimsInvalid`] if the claims
/// are rejected.
#[tracing::instrument(
    skip_all,
    fields(jwk.kid = tracing::field::Empty, jwk.alg = tracing::field::Empty),
)]
pub async fn authenticate(
    token: &JwtRef,
    verify: &VerifyOptions,
    validate: &ValidateOptions,
) -> Result<Token, AuthenticationError> {
    let decomposed: jwt::Decomposed<jwt::BasicHeaders> = token.decompose()?;

    let alg = decomposed.alg();
    let kid = decomposed
        .kid()
        .map(ToOwned::to_owned)
        .ok_or(SignatureError::MissingKeyId)?;

    let span = tracing::Span::current();
    span.record("jwk.kid", tracing::field::display(&kid));
    span.record("jwk.alg", tracing::field::display(alg));

    let key = verify
        .key_source()
        .resolve_key(&kid, Some(alg))
        .await
        .map_err(SignatureError::from)?
        .ok_or_else(|| {
            tracing::debug!("unable to find matching key");
            SignatureError::NoMatchingKey
        })?;

    let validated: jwt::Validated<Claims, jwt::BasicHeaders> =
        decomposed.verify_with_custom(key.key(), validate.core_validator(), validate.predicates())?;

    tracing::trace!("token authenticated");

    Ok(Token::from_validated(validated))
}

/// Verification and validation options bundled together
#[derive(Clone, Debug)]
pub struct Authenticator {
    verify: VerifyOptions,
    validate: ValidateOptions,
}

impl Authenticator {
    /// Constructs an authenticator from its options
    #[must_use]
    pub fn new(verify: VerifyOptions, validate: ValidateOptions) -> Self {
        Self { verify, validate }
    }

    /// The signature verification options
    #[must_use]
    pub fn verify_options(&self) -> &VerifyOptions {
        &self.verify
    }

    /// The claims validation options
    #[must_use]
    pub fn validate_options(&self) -> &ValidateOptions {
        &self.validate
    }

    /// Authenticates a token
    ///
    /// # Errors
    ///
    /// See [`authenticate`].
    pub async fn authenticate(&self, token: &JwtRef) -> Result<Token, AuthenticationError> {
        authenticate(token, &self.verify, &self.validate).await
    }
}

#[cfg(all(test, feature = "hmac"))]
mod tests {
    use aliri::{jwk, Jwks, Jwt};
    use aliri_clock::UnixTime;
    use color_eyre::Result;
    use serde_json::json;
    use tracing_test::traced_test;
    use wiremock::{matchers::any, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        test::{hmac_key, serve_issuer, sign, AUDIENCE, KID},
        KeyResolver, MissingKeyPolicy, Scope,
    };

    fn claims() -> Claims {
        Claims::new(
            jwt::BasicClaims::new()
                .with_subject(jwt::Subject::from_static("user-1"))
                .with_audience(jwt::Audience::from_static(AUDIENCE))
                .with_future_expiration(300),
        )
        .with_permissions(json!(["read"]))
    }

    fn validate() -> ValidateOptions {
        ValidateOptions::new().add_allowed_audience(jwt::Audience::from_static(AUDIENCE))
    }

    async fn resolver_for(jwks: &Jwks) -> Result<(MockServer, VerifyOptions)> {
        let server = serve_issuer(jwks).await;
        let resolver = KeyResolver::new(server.uri())?;
        Ok((server, VerifyOptions::new(resolver)))
    }

    fn published(key: &aliri::Jwk) -> Jwks {
        let mut jwks = Jwks::default();
        jwks.add_key(key.clone());
        jwks
    }

    #[tokio::test]
    #[traced_test]
    async fn hs256_token_with_published_key_verifies() -> Result<()> {
        let key = hmac_key(KID);
        let (_server, verify) = resolver_for(&published(&key)).await?;

        let issued = claims();
        let token = authenticate(&sign(&key, KID, &issued), &verify, &validate()).await?;

        assert_eq!(token.claims(), &issued);
        assert_eq!(token.key_id().unwrap().as_str(), KID);
        assert_eq!(token.algorithm(), jwa::Algorithm::HS256);
        assert_eq!(token.permissions().to_vec(), vec![Scope::Read]);
        Ok(())
    }

    #[cfg(feature = "rsa")]
    #[tokio::test]
    async fn rs256_token_with_published_key_verifies() -> Result<()> {
        let key = aliri::Jwk::from(jwa::Rsa::generate()?)
            .with_key_id(jwk::KeyId::from_static(KID))
            .with_algorithm(jwa::Algorithm::RS256);
        let (_server, verify) = resolver_for(&published(&key.clone().public_only())).await?;

        let issued = claims();
        let headers = jwt::BasicHeaders::with_key_id(jwa::Algorithm::RS256, jwk::KeyId::from_static(KID));
        let jwt = Jwt::try_from_parts_with_signature(&headers, &issued, &key)?;

        let token = authenticate(&jwt, &verify, &validate()).await?;
        assert_eq!(token.claims(), &issued);
        assert_eq!(token.algorithm(), jwa::Algorithm::RS256);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_kid_is_a_generic_signature_failure() -> Result<()> {
        let key = hmac_key(KID);
        let (_server, verify) = resolver_for(&published(&key)).await?;

        let stranger = hmac_key("someone-else");
        let jwt = sign(&stranger, "someone-else", &claims());

        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::SignatureInvalid(SignatureError::NoMatchingKey)
        ));
        assert_eq!(err.stage(), Stage::Signature);
        assert!(!err.is_upstream_failure());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kid_with_reject_policy_reports_key_not_found() -> Result<()> {
        let key = hmac_key(KID);
        let server = serve_issuer(&published(&key)).await;
        let resolver = KeyResolver::builder(server.uri())
            .with_missing_key_policy(MissingKeyPolicy::Reject)
            .build()?;
        let verify = VerifyOptions::new(resolver);

        let jwt = sign(&hmac_key("other"), "other", &claims());
        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();

        assert!(matches!(
            err,
            AuthenticationError::SignatureInvalid(SignatureError::KeyResolution(
                KeyResolutionError::KeyNotFound(_)
            ))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn audience_mismatch_is_claims_failure() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));

        let jwt = sign(&key, KID, &claims());
        let options =
            ValidateOptions::new().add_allowed_audience(jwt::Audience::from_static("another-api"));

        let err = authenticate(&jwt, &verify, &options).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::ClaimsInvalid(ClaimsRejected::InvalidAudience)
        ));
        assert_eq!(err.stage(), Stage::Claims);
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_claims_failure() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));

        let expired = Claims::new(
            jwt::BasicClaims::new()
                .with_audience(jwt::Audience::from_static(AUDIENCE))
                .with_expiration(UnixTime(1_000)),
        );
        let jwt = sign(&key, KID, &expired);

        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::ClaimsInvalid(ClaimsRejected::TokenExpired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn issuer_is_checked_when_required() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));
        let jwt = sign(&key, KID, &claims());

        let options = validate().require_issuer(jwt::Issuer::from_static("https://issuer.example/"));
        let err = authenticate(&jwt, &verify, &options).await.unwrap_err();

        assert!(matches!(
            err,
            AuthenticationError::ClaimsInvalid(ClaimsRejected::MissingRequiredClaim("iss"))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failing_predicate_carries_its_message() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));
        let jwt = sign(&key, KID, &claims());

        let options = validate().with_predicate(|_: &Claims| Err("subject is suspended"));
        let err = authenticate(&jwt, &verify, &options).await.unwrap_err();

        assert_eq!(err.stage(), Stage::Claims);
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "subject is suspended");
        Ok(())
    }

    #[tokio::test]
    async fn passing_predicate_accepts() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));
        let jwt = sign(&key, KID, &claims());

        let options = validate().with_predicate(|c: &Claims| {
            if c.permissions().contains(Scope::Read) {
                Ok(())
            } else {
                Err("read permission required")
            }
        });
        authenticate(&jwt, &verify, &options).await?;
        Ok(())
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));

        let jwt = sign(&key, KID, &claims());
        let (message, _) = jwt.as_str().rsplit_once('.').unwrap();
        let tampered = Jwt::from(format!("{message}.AAAA"));

        let err = authenticate(&tampered, &verify, &validate()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::SignatureInvalid(SignatureError::Rejected(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn token_signed_by_other_secret_is_rejected() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));

        let impostor = aliri::Jwk::from(jwa::Hmac::new(aliri_base64::Base64Url::from_raw(
            b"not-the-published-secret".to_vec(),
        )))
        .with_key_id(jwk::KeyId::from_static(KID))
        .with_algorithm(jwa::Algorithm::HS256);
        let jwt = sign(&impostor, KID, &claims());

        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Signature);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_token_is_signature_failure() -> Result<()> {
        let verify = VerifyOptions::new(Jwks::default());
        let jwt = Jwt::from_static("not-a-jwt");

        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::SignatureInvalid(SignatureError::Malformed(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn token_without_kid_is_rejected() -> Result<()> {
        let key = hmac_key(KID);
        let verify = VerifyOptions::new(published(&key));

        let headers = jwt::BasicHeaders::new(jwa::Algorithm::HS256);
        let jwt = Jwt::try_from_parts_with_signature(&headers, &claims(), &key)?;

        let err = authenticate(&jwt, &verify, &validate()).await.unwrap_err();
        assert!(matches!(
            err,
            AuthenticationError::SignatureInvalid(SignatureError::MissingKeyId)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_issuer_is_upstream_failure() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let verify = VerifyOptions::new(KeyResolver::new(server.uri())?);

        let key = hmac_key(KID);
        let err = authenticate(&sign(&key, KID, &claims()), &verify, &validate())
            .await
            .unwrap_err();

        assert!(err.is_upstream_failure());
        assert_eq!(err.stage(), Stage::Signature);
        Ok(())
    }

    #[tokio::test]
    async fn authenticator_bundles_options() -> Result<()> {
        let key = hmac_key(KID);
        let authenticator = Authenticator::new(VerifyOptions::new(published(&key)), validate());

        let token = authenticator.authenticate(&sign(&key, KID, &claims())).await?;
        assert_eq!(token.subject().unwrap().as_str(), "user-1");
        Ok(())
    }
}
