//! Tower middleware authenticating requests with OpenID Connect bearer
//! tokens and authorizing operations by scope
//!
//! The [`AuthenticationGate`] produces a `tower_http` authorization layer.
//! It reads a token from the request, verifies it with keys discovered from
//! the issuer, and attaches the resulting [`Token`][aliri_oidc::Token] to the
//! request extensions. Handlers then call [`RequireScopes::check`] (or
//! [`authorize`]) to confirm the token grants what the operation needs.
//!
//! See the `examples` folder in the repository for a working `axum` server.
//!
//! ```no_run
//! use axum::{body::Body, http::{Request, StatusCode}, routing::get, Router};
//! use aliri_oidc::{OidcSettings, Scope};
//! use aliri_tower::{AuthenticationGate, JsonErrorHandler, RequireScopes};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut settings = OidcSettings::new("login.example.com");
//! settings.audiences.push("https://api.example.com".into());
//!
//! // Error responses must share the router's body type
//! let gate = AuthenticationGate::from_authenticator(&settings.authenticator()?)
//!     .with_error_handler(JsonErrorHandler::<Body>::new());
//!
//! async fn list_widgets(request: Request<Body>) -> Result<&'static str, StatusCode> {
//!     RequireScopes::new([Scope::Read])
//!         .check(request.extensions())
//!         .map_err(|e| e.status_code())?;
//!     Ok("[]")
//! }
//!
//! let app: Router = Router::new()
//!     .route("/widgets", get(list_widgets))
//!     .layer(gate.layer());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, marker::PhantomData};

use aliri_oidc::AuthenticationError;
use http::Response;

mod authorize;
mod context;
mod extract;
mod gate;
pub mod util;


pub use authorize::{authorize, AuthorizationError, RequireScopes};
pub use context::{token_from, with_token};
pub use extract::{
    FirstOf, FromAuthorizationHeader, FromHeader, FromQuery, RequestHead, TokenExtractor,
    TokenNotFound,
};
pub use gate::{Authenticate, AuthenticateOverrides, AuthenticationGate, OnAuthError};

/// Responds to authentication failures with a JSON error body
///
/// By default the body carries the full error chain, such as
/// `claims invalid: invalid audience`. A [terse][JsonErrorHandler::terse]
/// handler reports only `unauthenticated` for rejected tokens.
pub struct JsonErrorHandler<ResBody = String> {
    verbose: bool,
    describe: bool,
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> JsonErrorHandler<ResBody> {
    /// A handler reporting the full error chain
    #[inline]
    pub fn new() -> Self {
        Self {
            verbose: true,
            describe: false,
            _ty: PhantomData,
        }
    }

    /// A handler that hides why a token was rejected
    #[inline]
    pub fn terse() -> Self {
        Self {
            verbose: false,
            ..Self::new()
        }
    }

    /// Also repeats the message as `error_description` in the
    /// `www-authenticate` challenge
    #[inline]
    #[must_use]
    pub fn with_error_description(self) -> Self {
        Self {
            describe: true,
            ..self
        }
    }

    fn respond(&self, message: &str) -> Response<ResBody>
    where
        ResBody: From<String>,
    {
        if self.describe {
            util::unauthorized_with_description(message)
        } else {
            util::unauthorized(message)
        }
    }
}

impl<ResBody> fmt::Debug for JsonErrorHandler<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JsonErrorHandler")
            .field("verbose", &self.verbose)
            .field("describe", &self.describe)
            .finish()
    }
}

impl<ResBody> Default for JsonErrorHandler<ResBody> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<ResBody> Clone for JsonErrorHandler<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<ResBody> Copy for JsonErrorHandler<ResBody> {}

impl<ResBody> OnAuthError for JsonErrorHandler<ResBody>
where
    ResBody: From<String>,
{
    type Body = ResBody;

    #[inline]
    fn on_missing_token(&self, error: &TokenNotFound) -> Response<Self::Body> {
        self.respond(&error.to_string())
    }

    fn on_rejected(&self, error: &AuthenticationError) -> Response<Self::Body> {
        if self.verbose {
            self.respond(&error_chain(error))
        } else {
            self.respond("unauthenticated")
        }
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    use std::fmt::Write;

    let mut description = error.to_string();
    let mut err = error;
    while let Some(next) = err.source() {
        let _ = write!(&mut description, ": {next}");
        err = next;
    }
    description
}

#[cfg(test)]
mod tests {
    use aliri_oidc::SignatureError;
    use http::header;

    use super::*;

    #[test]
    fn verbose_body_carries_error_chain() {
        let err = AuthenticationError::from(SignatureError::NoMatchingKey);
        let resp = JsonErrorHandler::<String>::new().on_rejected(&err);

        assert_eq!(
            resp.body(),
            r#"{"error":"signature invalid: no matching key found to validate JWT"}"#
        );
    }

    #[test]
    fn terse_body_hides_reason() {
        let err = AuthenticationError::from(SignatureError::NoMatchingKey);
        let resp = JsonErrorHandler::<String>::terse().on_rejected(&err);

        assert_eq!(resp.body(), r#"{"error":"unauthenticated"}"#);
    }

    #[test]
    fn missing_token_message_is_kept_when_terse() {
        let resp = JsonErrorHandler::<String>::terse().on_missing_token(&TokenNotFound);
        assert_eq!(resp.body(), r#"{"error":"token not found"}"#);
    }

    #[test]
    fn description_is_opt_in() {
        let err = AuthenticationError::from(SignatureError::MissingKeyId);
        let resp = JsonErrorHandler::<String>::new()
            .with_error_description()
            .on_rejected(&err);

        assert_eq!(
            resp.headers()[header::WWW_AUTHENTICATE],
            r#"Bearer error="invalid_token" error_description="signature invalid: token header has no kid""#
        );
    }
}
