use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Sha3};

use crate::{
    abe_policy::{AttributeSet, AttributeToken},
    Error,
};

/// Domain separator of the policy digest.
const POLICY_DOMAIN: &[u8] = b"ride_crypt policy v1";

/// An `AccessPolicy` is a conjunction of required attributes.
///
/// Row `i` requires the attribute `rho[i]`; a holder satisfies the policy iff
/// it holds every row's attribute. Rows are dense (`0..n-1`), there is at
/// least one row and no attribute appears twice.
///
/// Only the satisfaction predicate ([`Self::is_satisfied_by`]) and the
/// row-to-share mapping of the crypto engine depend on this shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessPolicy {
    rho: Vec<AttributeToken>,
}

impl AccessPolicy {
    /// Creates a policy from its row-to-attribute mapping.
    pub fn from_rows(rho: Vec<AttributeToken>) -> Result<Self, Error> {
        if rho.is_empty() {
            return Err(Error::InvalidPolicy(
                "a policy needs at least one row".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(rho.len());
        for (row, token) in rho.iter().enumerate() {
            if !seen.insert(token) {
                return Err(Error::InvalidPolicy(format!(
                    "row {row} repeats attribute {token}"
                )));
            }
        }
        Ok(Self { rho })
    }

    /// Creates a policy requiring all the given attribute names.
    ///
    /// ```
    /// use ride_crypt::abe_policy::{AccessPolicy, AttributeSet};
    ///
    /// let policy = AccessPolicy::all_of(["verified", "premium"]).unwrap();
    /// let driver = AttributeSet::from_names(["Premium", "verified", "ev"]).unwrap();
    /// assert!(policy.is_satisfied_by(&driver));
    /// ```
    pub fn all_of<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, Error> {
        names
            .into_iter()
            .map(AttributeToken::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidPolicy(e.to_string()))
            .and_then(Self::from_rows)
    }

    /// Converts a boolean expression into an `AccessPolicy`.
    ///
    /// Only the `&&` operator and parentheses are accepted, e.g.
    /// `verified && (premium && licensed)`. A disjunction is rejected with
    /// [`Error::UnsupportedOperator`].
    pub fn parse(boolean_expression: &str) -> Result<Self, Error> {
        if boolean_expression.contains("||") {
            return Err(Error::UnsupportedOperator("||".to_string()));
        }

        let mut depth = 0_i32;
        for c in boolean_expression.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                return Err(Error::InvalidBooleanExpression(format!(
                    "unexpected closing parenthesis in {boolean_expression}"
                )));
            }
        }
        if depth != 0 {
            return Err(Error::InvalidBooleanExpression(format!(
                "missing closing parenthesis in {boolean_expression}"
            )));
        }

        let mut names = Vec::new();
        for term in boolean_expression.split("&&") {
            let name = term
                .trim()
                .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
                .trim_end_matches(|c: char| c == ')' || c.is_whitespace());
            if name.is_empty() || name.contains(['(', ')']) {
                return Err(Error::InvalidBooleanExpression(format!(
                    "'{}' is not an attribute name in {boolean_expression}",
                    term.trim()
                )));
            }
            names.push(name);
        }
        Self::all_of(names)
    }

    /// Parses a JSON policy document, see [`PolicyDocument`].
    pub fn from_json(document: &str) -> Result<Self, Error> {
        serde_json::from_str::<PolicyDocument>(document)
            .map_err(|e| Error::InvalidPolicy(e.to_string()))
            .and_then(Self::try_from)
    }

    /// Attribute required by the given row.
    #[must_use]
    pub fn rho(&self, row: usize) -> Option<&AttributeToken> {
        self.rho.get(row)
    }

    /// Row-to-attribute mapping, in row order.
    #[must_use]
    pub fn rows(&self) -> &[AttributeToken] {
        &self.rho
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rho.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rho.is_empty()
    }

    /// Returns true iff every row's attribute belongs to the given set.
    ///
    /// Extra attributes held by the candidate are irrelevant.
    #[must_use]
    pub fn is_satisfied_by(&self, attributes: &AttributeSet) -> bool {
        self.rho.iter().all(|token| attributes.contains(token))
    }

    /// Set of attributes required by this policy.
    #[must_use]
    pub fn required_attributes(&self) -> AttributeSet {
        self.rho.iter().copied().collect()
    }

    /// Digest identifying this policy, row order included.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha3::v256();
        hasher.update(POLICY_DOMAIN);
        hasher.update(&(self.rho.len() as u64).to_le_bytes());
        for token in &self.rho {
            hasher.update(token.as_ref());
        }
        let mut res = [0; 32];
        hasher.finalize(&mut res);
        res
    }
}

/// Tagged wire form of an access policy.
///
/// ```json
/// { "kind": "all_of", "rho": { "0": "verified", "1": "premium" } }
/// ```
///
/// Row indices are JSON object keys, hence strings; they are parsed when the
/// document is turned into an [`AccessPolicy`]. The optional `matrix` is the
/// row matrix of a linear secret sharing scheme; for a conjunctive policy it
/// only has to provide one row per `rho` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyDocument {
    AllOf {
        rho: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matrix: Option<Vec<Vec<i64>>>,
    },
}

impl TryFrom<PolicyDocument> for AccessPolicy {
    type Error = Error;

    fn try_from(document: PolicyDocument) -> Result<Self, Self::Error> {
        let PolicyDocument::AllOf { rho, matrix } = document;
        let rho = rho
            .into_iter()
            .map(|(row, name)| {
                row.trim()
                    .parse::<usize>()
                    .map(|row| (row, name))
                    .map_err(|_| Error::InvalidPolicy(format!("invalid row index {row:?}")))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        if let Some((row, _)) = rho.keys().enumerate().find(|(i, row)| i != *row) {
            return Err(Error::InvalidPolicy(format!(
                "rows must be dense, row {row} is missing"
            )));
        }
        if let Some(matrix) = matrix {
            if matrix.len() != rho.len() {
                return Err(Error::InvalidPolicy(format!(
                    "matrix has {} rows but rho maps {}",
                    matrix.len(),
                    rho.len()
                )));
            }
        }
        Self::all_of(rho.values().map(String::as_str))
    }
}
