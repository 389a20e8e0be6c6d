//! Hierarchical identifiers.
//!
//! An [`Identifier`] is a `/`-separated path such as `contrail/root/revisions/3`.
//! It is the universal key of the system: raw storage is addressed by it,
//! entities carry one, and B-tree pages are stored under their tree's
//! identifier.
//!
//! # Invariants
//!
//! - The path is never empty and never contains empty segments.
//! - Ordering is lexicographic over the string form.
//! - Identifiers are immutable; `child` and `parent` build new values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// A hierarchical, totally ordered storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

/// Error returned when a path cannot be turned into an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidIdentifier(pub String);

impl fmt::Display for InvalidIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier: '{}'", self.0)
    }
}

impl std::error::Error for InvalidIdentifier {}

impl Identifier {
    /// Build an identifier from a path.
    ///
    /// Leading, trailing and repeated separators are dropped, so
    /// `"/a//b/"` and `"a/b"` name the same identifier.
    pub fn new(path: &str) -> Result<Self, InvalidIdentifier> {
        let normalised = path
            .split(SEPARATOR)
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        if normalised.is_empty() {
            return Err(InvalidIdentifier(path.to_string()));
        }
        Ok(Self(normalised))
    }

    /// A fresh identifier made of a single random segment.
    #[must_use]
    pub fn unique() -> Self {
        Self(unique_segment())
    }

    /// A fresh random child of `parent`.
    #[must_use]
    pub fn unique_child(parent: &Self) -> Self {
        parent.child(&unique_segment())
    }

    /// The child of this identifier named `name`.
    ///
    /// Separators inside `name` are treated as further nesting.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let name = name.trim_matches(SEPARATOR);
        if name.is_empty() {
            return self.clone();
        }
        let mut path = String::with_capacity(self.0.len() + 1 + name.len());
        path.push_str(&self.0);
        for segment in name.split(SEPARATOR).filter(|s| !s.is_empty()) {
            path.push(SEPARATOR);
            path.push_str(segment);
        }
        Self(path)
    }

    /// The parent identifier, or `None` for a top-level identifier.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rfind(SEPARATOR)
            .map(|index| Self(self.0[..index].to_string()))
    }

    /// The last path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0
            .rfind(SEPARATOR)
            .map_or(self.0.as_str(), |index| &self.0[index + 1..])
    }

    /// All path segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Number of segments in the path.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// Every ancestor of this identifier, nearest first.
    #[must_use]
    pub fn ancestors(&self) -> Vec<Self> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(id) = current {
            current = id.parent();
            ancestors.push(id);
        }
        ancestors
    }

    /// Whether `other` lives somewhere below this identifier.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(SEPARATOR)
    }

    /// Whether `other` is an immediate child of this identifier.
    #[must_use]
    pub fn is_parent_of(&self, other: &Self) -> bool {
        other.parent().is_some_and(|parent| parent == *self)
    }

    /// The path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Identifier {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn unique_segment() -> String {
    format!("{:032x}", rand::random::<u128>())
}
