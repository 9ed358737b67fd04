use std::{
    collections::BTreeSet,
    fmt::{Debug, Display},
};

use crate::{sha3_256, Error};

/// Length of an attribute token.
pub const ATTRIBUTE_TOKEN_LENGTH: usize = 32;

/// Domain separator used when hashing attribute names into tokens.
const ATTRIBUTE_DOMAIN: &[u8] = b"ride_crypt attribute v1";

/// Fixed-width token standing for one attribute.
///
/// Attribute names never cross the trust boundary: they are normalized once
/// and hashed into a token, and all comparisons are made on tokens.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeToken([u8; ATTRIBUTE_TOKEN_LENGTH]);

impl AttributeToken {
    /// Normalizes and hashes the given attribute name.
    ///
    /// Leading and trailing whitespace is dropped, inner whitespace runs are
    /// collapsed into a single space and the name is lower-cased, so that
    /// ` Verified ` and `verified` map to the same token.
    pub fn new(name: &str) -> Result<Self, Error> {
        let canonical = Self::normalize(name);
        if canonical.is_empty() {
            return Err(Error::InvalidAttributes(format!(
                "attribute name '{name}' is empty once normalized"
            )));
        }
        Ok(Self(sha3_256!(ATTRIBUTE_DOMAIN, canonical.as_bytes())))
    }

    /// Returns the canonical form of an attribute name.
    #[must_use]
    pub fn normalize(name: &str) -> String {
        name.split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; ATTRIBUTE_TOKEN_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn to_bytes(&self) -> [u8; ATTRIBUTE_TOKEN_LENGTH] {
        self.0
    }
}

impl AsRef<[u8]> for AttributeToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for AttributeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Debug for AttributeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AttributeToken({self})")
    }
}

/// Set of attribute tokens held by a party. Immutable once presented.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttributeSet(BTreeSet<AttributeToken>);

impl AttributeSet {
    /// Builds a set from attribute names, normalizing each one.
    ///
    /// An empty list is accepted here; operations requiring at least one
    /// attribute check for it themselves.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, Error> {
        names
            .into_iter()
            .map(AttributeToken::new)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    #[must_use]
    pub fn from_tokens(tokens: impl IntoIterator<Item = AttributeToken>) -> Self {
        Self(tokens.into_iter().collect())
    }

    #[must_use]
    pub fn contains(&self, token: &AttributeToken) -> bool {
        self.0.contains(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the tokens in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &AttributeToken> {
        self.0.iter()
    }
}

impl FromIterator<AttributeToken> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = AttributeToken>>(iter: T) -> Self {
        Self::from_tokens(iter)
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = &'a AttributeToken;
    type IntoIter = std::collections::btree_set::Iter<'a, AttributeToken>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
