//! Deserializable settings for an OpenID Connect issuer

use std::time::Duration;

use aliri::jwt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    resolver::DEFAULT_DISCOVERY_PATH, Authenticator, KeyResolutionError, KeyResolver,
    MissingKeyPolicy, ValidateOptions, VerifyOptions,
};

/// Settings could not be turned into an authenticator
#[derive(Debug, Error)]
pub enum SettingsError {
    /// No audience was configured, so the `aud` claim could not be checked
    #[error("at least one audience must be configured")]
    MissingAudience,
    /// The key resolver could not be constructed
    #[error("unable to construct key resolver")]
    KeyResolver(#[from] KeyResolutionError),
}

fn default_discovery_path() -> String {
    DEFAULT_DISCOVERY_PATH.to_owned()
}

/// Settings describing the issuer to trust and the claims to require
///
/// At least one audience is required. Tokens whose `aud` claim names none of
/// the configured audiences are rejected. Hosts that really need to accept any
/// audience can build [`ValidateOptions`] by hand instead.
///
/// ```
/// use aliri_oidc::OidcSettings;
///
/// let settings: OidcSettings = serde_json::from_str(r#"{
///     "issuer": "login.example.com",
///     "audiences": ["https://api.example.com"],
///     "leeway_secs": 30
/// }"#).unwrap();
///
/// let authenticator = settings.authenticator().unwrap();
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcSettings {
    /// The issuer domain, or an origin with an explicit scheme
    pub issuer: String,
    /// The path of the discovery document on the issuer
    #[serde(default = "default_discovery_path")]
    pub discovery_path: String,
    /// Accepted audiences; at least one is required
    #[serde(default)]
    pub audiences: Vec<String>,
    /// The exact `iss` claim value to require, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_issuer: Option<String>,
    /// Tolerated clock skew for time-based claims, in seconds
    #[serde(default)]
    pub leeway_secs: u64,
    /// Bound on each request to the issuer, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// What to do when no published key matches a token's `kid`
    #[serde(default)]
    pub missing_key_policy: MissingKeyPolicy,
}

impl OidcSettings {
    /// Settings for an issuer with every other option left at its default
    #[must_use]
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            discovery_path: default_discovery_path(),
            audiences: Vec::new(),
            required_issuer: None,
            leeway_secs: 0,
            timeout_secs: None,
            missing_key_policy: MissingKeyPolicy::default(),
        }
    }

    /// Constructs a key resolver for the configured issuer
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer is empty or the HTTP client cannot be
    /// constructed.
    pub fn key_resolver(&self) -> Result<KeyResolver, KeyResolutionError> {
        let mut builder = KeyResolver::builder(self.issuer.clone())
            .with_discovery_path(self.discovery_path.clone())
            .with_missing_key_policy(self.missing_key_policy);

        if let Some(secs) = self.timeout_secs {
            builder = builder.with_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// Constructs the claims validation options
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError::MissingAudience`] if no audience is configured.
    pub fn validate_options(&self) -> Result<ValidateOptions, SettingsError> {
        if self.audiences.is_empty() {
            return Err(SettingsError::MissingAudience);
        }

        let mut options = self.audiences.iter().fold(ValidateOptions::new(), |opts, aud| {
            opts.add_allowed_audience(jwt::Audience::from(aud.clone()))
        });

        if let Some(issuer) = &self.required_issuer {
            options = options.require_issuer(jwt::Issuer::from(issuer.clone()));
        }

        if self.leeway_secs > 0 {
            options = options.with_leeway(Duration::from_secs(self.leeway_secs));
        }

        Ok(options)
    }

    /// Constructs an authenticator resolving keys from the configured issuer
    ///
    /// # Errors
    ///
    /// See [`key_resolver`][Self::key_resolver] and
    /// [`validate_options`][Self::validate_options].
    pub fn authenticator(&self) -> Result<Authenticator, SettingsError> {
        Ok(Authenticator::new(
            VerifyOptions::new(self.key_resolver()?),
            self.validate_options()?,
        ))
    }
}
