//! JWT authentication against OpenID Connect issuers
//!
//! Tokens are verified with keys published by the issuer. Each verification
//! reads the issuer's discovery document, follows its `jwks_uri`, and picks
//! the key named by the token's `kid`. Once the signature checks out, the
//! claims are validated and the result is handed back as a [`Token`].
//!
//! Access is granted by comparing the [`Scope`]s named in a token's
//! `permissions` claim against the scopes an operation requires, using
//! [`PermissionSet`].
//!
//! ```no_run
//! use aliri::{jwt, JwtRef};
//! use aliri_oidc::{Authenticator, KeyResolver, PermissionSet, Scope, ValidateOptions, VerifyOptions};
//!
//! # async fn example(token: &JwtRef) -> Result<(), Box<dyn std::error::Error>> {
//! let authenticator = Authenticator::new(
//!     VerifyOptions::new(KeyResolver::new("login.example.com")?),
//!     ValidateOptions::new()
//!         .add_allowed_audience(jwt::Audience::from_static("https://api.example.com")),
//! );
//!
//! let token = authenticator.authenticate(token).await?;
//!
//! let required = PermissionSet::new([Scope::Read]);
//! if token.permissions().is_superset_of(&required) {
//!     println!("access granted to {:?}", token.subject());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Feature flags
//!
//! This crate does not enable TLS support in `reqwest` on its own. If your
//! application already uses `reqwest` with some TLS settings
//! (native/OpenSSL/rustls), this crate will use those settings. Otherwise,
//! enable the `default-tls` or `rustls-tls` feature to be able to reach an
//! HTTPS issuer.

#![cfg_attr(docsrs, feature(doc_cfg))]
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

mod authenticator;
mod permission;
pub mod resolver;
pub mod scope;
mod settings;
mod token;

#[cfg(test)]
mod test;

pub use authenticator::{
    authenticate, AuthenticationError, Authenticator, SignatureError, Stage, ValidateOptions,
    VerifyOptions,
};
pub use permission::{parse_permission_claim, PermissionSet};
pub use resolver::{
    compatible_algorithms, KeyResolutionError, KeyResolver, KeyResolverBuilder, KeySource,
    MissingKeyPolicy, ResolvedKey, DEFAULT_DISCOVERY_PATH,
};
pub use scope::{InvalidScope, Scope};
pub use settings::{OidcSettings, SettingsError};
pub use token::{Claims, Token, PERMISSIONS_CLAIM};
