//! Sets of granted or required scopes

use std::{
    fmt,
    iter::FromIterator,
    ptr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ahash::AHashSet;
use serde_json::Value;

use crate::Scope;

/// A deduplicated set of [`Scope`]s
///
/// The set may be shared between tasks and grown through a shared reference
/// with [`add`][PermissionSet::add]. Sets are compared by inclusion only; two
/// sets are never checked for equality.
///
/// ```
/// use aliri_oidc::{PermissionSet, Scope};
///
/// let granted = PermissionSet::new([Scope::Read, Scope::Write]);
/// let required = PermissionSet::new([Scope::Read]);
///
/// assert!(granted.is_superset_of(&required));
/// assert!(!required.is_superset_of(&granted));
/// ```
#[derive(Default)]
pub struct PermissionSet {
    scopes: Mutex<AHashSet<Scope>>,
}

impl PermissionSet {
    /// Constructs a set from the given scopes, dropping duplicates
    #[must_use]
    pub fn new<I>(scopes: I) -> Self
    where
        I: IntoIterator<Item = Scope>,
    {
        Self {
            scopes: Mutex::new(scopes.into_iter().collect()),
        }
    }

    /// Produces an empty set
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds scopes to the set
    pub fn add<I>(&self, scopes: I)
    where
        I: IntoIterator<Item = Scope>,
    {
        self.lock().extend(scopes);
    }

    /// Whether the scope is a member of this set
    #[must_use]
    pub fn contains(&self, scope: Scope) -> bool {
        self.lock().contains(&scope)
    }

    /// The number of distinct scopes in the set
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the set holds no scopes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Checks whether every scope in `other` is also held by this set
    ///
    /// An empty `other` is satisfied by any set.
    #[must_use]
    pub fn is_superset_of(&self, other: &PermissionSet) -> bool {
        if ptr::eq(self, other) {
            return true;
        }

        // Both locks are always taken lower address first.
        let (mine, theirs) = if ptr::from_ref(self) < ptr::from_ref(other) {
            let mine = self.lock();
            let theirs = other.lock();
            (mine, theirs)
        } else {
            let theirs = other.lock();
            let mine = self.lock();
            (mine, theirs)
        };

        if mine.len() < theirs.len() {
            return false;
        }

        theirs.iter().all(|scope| mine.contains(scope))
    }

    /// The members of the set as strings, sorted
    #[must_use]
    pub fn strings(&self) -> Vec<&'static str> {
        let mut strings: Vec<_> = self.lock().iter().map(|s| s.as_str()).collect();
        strings.sort_unstable();
        strings
    }

    /// A point-in-time copy of the members, sorted
    #[must_use]
    pub fn to_vec(&self) -> Vec<Scope> {
        let mut scopes: Vec<_> = self.lock().iter().copied().collect();
        scopes.sort_unstable();
        scopes
    }

    fn lock(&self) -> MutexGuard<'_, AHashSet<Scope>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clone for PermissionSet {
    fn clone(&self) -> Self {
        Self {
            scopes: Mutex::new(self.lock().clone()),
        }
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.strings()).finish()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.strings().join(" "))
    }
}

impl FromIterator<Scope> for PermissionSet {
    #[inline]
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl Extend<Scope> for PermissionSet {
    #[inline]
    fn extend<I: IntoIterator<Item = Scope>>(&mut self, iter: I) {
        self.add(iter)
    }
}

/// Reads a `permissions` claim value into a [`PermissionSet`]
///
/// The claim is expected to be an array of strings. Anything else yields an
/// empty set. Entries that are not strings or that do not name a known
/// [`Scope`] are skipped.
///
/// ```
/// use aliri_oidc::{parse_permission_claim, Scope};
/// use serde_json::json;
///
/// let claim = json!(["read", 42, "unknown"]);
/// let set = parse_permission_claim(Some(&claim));
///
/// assert_eq!(set.len(), 1);
/// assert!(set.contains(Scope::Read));
/// ```
#[must_use]
pub fn parse_permission_claim(claim: Option<&Value>) -> PermissionSet {
    let entries = match claim {
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            tracing::trace!(claim.kind = value_kind(other), "permissions claim is not an array");
            return PermissionSet::empty();
        }
        None => return PermissionSet::empty(),
    };

    entries
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|s| match s.parse::<Scope>() {
            Ok(scope) => Some(scope),
            Err(_) => {
                tracing::trace!(scope = s, "skipping unknown scope");
                None
            }
        })
        .collect()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
