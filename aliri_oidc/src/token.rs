//! Authenticated tokens

use aliri::{
    jwa, jwk,
    jwt::{self, CoreClaims as _, CoreHeaders as _, HasAlgorithm as _},
};
use aliri_clock::UnixTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{permission, PermissionSet};

/// The name of the claim carrying the granted permissions
pub const PERMISSIONS_CLAIM: &str = "permissions";

/// The claims payload of a token issued by an OpenID Connect provider
///
/// The registered claims are handled by [`jwt::BasicClaims`]. The
/// `permissions` claim is kept as raw JSON; it is only interpreted when an
/// operation asks for it through [`Claims::permissions`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct Claims {
    #[serde(flatten)]
    basic: jwt::BasicClaims,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    permissions: Option<Value>,
}

impl Claims {
    /// Constructs a claims payload from the registered claims
    pub const fn new(basic: jwt::BasicClaims) -> Self {
        Self {
            basic,
            permissions: None,
        }
    }

    /// Sets the raw `permissions` claim
    pub fn with_permissions(self, permissions: Value) -> Self {
        Self {
            permissions: Some(permissions),
            ..self
        }
    }

    /// The raw `permissions` claim, as presented in the token
    #[must_use]
    pub fn raw_permissions(&self) -> Option<&Value> {
        self.permissions.as_ref()
    }

    /// The recognized scopes named by the `permissions` claim
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        permission::parse_permission_claim(self.permissions.as_ref())
    }

    /// The registered claims
    pub fn basic(&self) -> &jwt::BasicClaims {
        &self.basic
    }
}

impl jwt::CoreClaims for Claims {
    #[inline]
    fn nbf(&self) -> Option<UnixTime> {
        self.basic.nbf()
    }

    #[inline]
    fn exp(&self) -> Option<UnixTime> {
        self.basic.exp()
    }

    #[inline]
    fn aud(&self) -> &jwt::Audiences {
        self.basic.aud()
    }

    #[inline]
    fn iss(&self) -> Option<&jwt::IssuerRef> {
        self.basic.iss()
    }

    #[inline]
    fn sub(&self) -> Option<&jwt::SubjectRef> {
        self.basic.sub()
    }
}

/// A token whose signature has been verified and whose claims have been
/// validated
///
/// A `Token` can only be produced by an [`Authenticator`][crate::Authenticator].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    headers: jwt::BasicHeaders,
    claims: Claims,
}

impl Token {
    pub(crate) fn from_validated(validated: jwt::Validated<Claims, jwt::BasicHeaders>) -> Self {
        let (headers, claims) = validated.extract();
        Self { headers, claims }
    }

    /// The verified token headers
    #[must_use]
    pub fn headers(&self) -> &jwt::BasicHeaders {
        &self.headers
    }

    /// The validated token claims
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// The algorithm the token was signed with
    #[must_use]
    pub fn algorithm(&self) -> jwa::Algorithm {
        self.headers.alg()
    }

    /// The ID of the key that verified the token
    #[must_use]
    pub fn key_id(&self) -> Option<&jwk::KeyIdRef> {
        self.headers.kid()
    }

    /// The `sub` claim
    #[must_use]
    pub fn subject(&self) -> Option<&jwt::SubjectRef> {
        self.claims.sub()
    }

    /// The `iss` claim
    #[must_use]
    pub fn issuer(&self) -> Option<&jwt::IssuerRef> {
        self.claims.iss()
    }

    /// The `aud` claim
    #[must_use]
    pub fn audiences(&self) -> &jwt::Audiences {
        self.claims.aud()
    }

    /// The `exp` claim
    #[must_use]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.claims.exp()
    }

    /// The recognized scopes granted to the bearer
    #[must_use]
    pub fn permissions(&self) -> PermissionSet {
        self.claims.permissions()
    }
}
