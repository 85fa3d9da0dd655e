//! The vocabulary of access scopes

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The value was not a member of the scope vocabulary
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid scope: {value:?}")]
pub struct InvalidScope {
    value: String,
}

impl InvalidScope {
    /// The rejected value
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A single named permission
///
/// The vocabulary is closed: a string either names one of these variants or
/// is rejected by [`Scope::from_str`]. New scopes are added as new variants.
///
/// ```
/// use aliri_oidc::Scope;
///
/// assert_eq!("read".parse::<Scope>().unwrap(), Scope::Read);
/// assert!("admin".parse::<Scope>().is_err());
/// ```
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
#[non_exhaustive]
pub enum Scope {
    /// Read access
    Read,
    /// Write access
    Write,
}

impl Scope {
    /// Every scope in the vocabulary
    pub const ALL: &'static [Scope] = &[Scope::Read, Scope::Write];

    /// The wire representation of the scope
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = InvalidScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| InvalidScope {
                value: s.to_owned(),
            })
    }
}

impl TryFrom<String> for Scope {
    type Error = InvalidScope;

    #[inline]
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl TryFrom<&'_ str> for Scope {
    type Error = InvalidScope;

    #[inline]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}
