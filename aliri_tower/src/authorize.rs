//! Checking an authenticated token against required scopes

use std::{future::Future, sync::Arc};

use aliri_oidc::{PermissionSet, Scope};
use http::{Extensions, StatusCode};
use thiserror::Error;

use crate::context::token_from;

/// The request may not perform the operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum AuthorizationError {
    /// No authenticated token is attached to the request
    #[error("unauthenticated")]
    Unauthenticated,

    /// The token does not grant every required scope
    #[error("insufficient permission")]
    InsufficientPermission,
}

impl AuthorizationError {
    /// The HTTP status a host would typically report for this error
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermission => StatusCode::FORBIDDEN,
        }
    }
}

/// Checks that the token attached to `extensions` grants every scope in
/// `required`
///
/// An empty `required` set admits any authenticated token.
///
/// # Errors
///
/// * [`AuthorizationError::Unauthenticated`] if no token was attached by
///   the authentication gate
/// * [`AuthorizationError::InsufficientPermission`] if the token's
///   `permissions` claim is missing any required scope
#[tracing::instrument(
    skip_all,
    fields(
        authz.required_permission = %required,
        authz.allowed_permission,
    ),
)]
pub fn authorize(extensions: &Extensions, required: &PermissionSet) -> Result<(), AuthorizationError> {
    let token = token_from(extensions).ok_or_else(|| {
        tracing::debug!("no authenticated token on request");
        AuthorizationError::Unauthenticated
    })?;

    let allowed = token.permissions();
    tracing::Span::current().record("authz.allowed_permission", tracing::field::display(&allowed));

    if allowed.is_superset_of(required) {
        tracing::trace!("permission granted");
        Ok(())
    } else {
        tracing::debug!("permission denied");
        Err(AuthorizationError::InsufficientPermission)
    }
}

/// A statically declared set of scopes guarding an operation
///
/// ```
/// use aliri_oidc::Scope;
/// use aliri_tower::RequireScopes;
///
/// let writers = RequireScopes::new([Scope::Write]);
/// assert!(writers.scopes().contains(Scope::Write));
/// ```
#[derive(Clone, Debug)]
pub struct RequireScopes {
    required: Arc<PermissionSet>,
}

impl RequireScopes {
    /// Requires every one of the given scopes
    pub fn new<I>(scopes: I) -> Self
    where
        I: IntoIterator<Item = Scope>,
    {
        Self {
            required: Arc::new(PermissionSet::new(scopes)),
        }
    }

    /// The required scopes
    #[inline]
    pub fn scopes(&self) -> &PermissionSet {
        &self.required
    }

    /// Checks the token attached to `extensions`
    ///
    /// # Errors
    ///
    /// See [`authorize`].
    #[inline]
    pub fn check(&self, extensions: &Extensions) -> Result<(), AuthorizationError> {
        authorize(extensions, &self.required)
    }

    /// Runs `next` only when the token attached to `extensions` is allowed
    ///
    /// # Errors
    ///
    /// See [`authorize`]. `next` is not invoked on error.
    pub async fn guard<F, Fut, T>(&self, extensions: &Extensions, next: F) -> Result<T, AuthorizationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.check(extensions)?;
        Ok(next().await)
    }
}
