//! Lifecycle configuration.

use std::{collections::BTreeSet, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    lifecycle::{Address, Amount},
    Error,
};

const fn default_rating_window_secs() -> u64 {
    24 * 3600
}

const fn default_attempts() -> u32 {
    3
}

/// Roles, collateral minimums and retry bounds of a deployment.
///
/// ```json
/// {
///     "authorized_matchers": ["0xmatcher"],
///     "arbiters": ["0xarbiter"],
///     "min_requester_collateral": 10,
///     "min_provider_collateral": 5
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Addresses allowed to match requests and submit re-encryptions.
    #[serde(default)]
    pub authorized_matchers: BTreeSet<Address>,

    /// Addresses allowed to resolve disputes.
    #[serde(default)]
    pub arbiters: BTreeSet<Address>,

    #[serde(default)]
    pub min_requester_collateral: Amount,

    #[serde(default)]
    pub min_provider_collateral: Amount,

    /// Time during which parties may rate a completed ride.
    #[serde(default = "default_rating_window_secs")]
    pub rating_window_secs: u64,

    /// Attempts of the crypto step of a match on transient failures.
    #[serde(default = "default_attempts")]
    pub max_crypto_attempts: u32,

    /// Attempts of a ledger commit on transient failures.
    #[serde(default = "default_attempts")]
    pub max_commit_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            authorized_matchers: BTreeSet::new(),
            arbiters: BTreeSet::new(),
            min_requester_collateral: 0,
            min_provider_collateral: 0,
            rating_window_secs: default_rating_window_secs(),
            max_crypto_attempts: default_attempts(),
            max_commit_attempts: default_attempts(),
        }
    }
}

impl Config {
    /// Parses and validates a JSON configuration.
    pub fn from_json(content: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_crypto_attempts == 0 || self.max_commit_attempts == 0 {
            return Err(Error::InvalidConfig(
                "retry bounds must allow at least one attempt".to_string(),
            ));
        }
        if self.rating_window_secs == 0 {
            return Err(Error::InvalidConfig(
                "the rating window cannot be empty".to_string(),
            ));
        }
        if let Some(address) = self
            .authorized_matchers
            .iter()
            .chain(&self.arbiters)
            .find(|a| a.as_str().trim().is_empty())
        {
            return Err(Error::InvalidConfig(format!(
                "'{address}' is not a ledger address"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_matcher(&self, address: &Address) -> bool {
        self.authorized_matchers.contains(address)
    }

    #[must_use]
    pub fn is_arbiter(&self, address: &Address) -> bool {
        self.arbiters.contains(address)
    }

    #[must_use]
    pub fn with_matcher(mut self, address: impl Into<String>) -> Self {
        self.authorized_matchers.insert(Address::new(address));
        self
    }

    #[must_use]
    pub fn with_arbiter(mut self, address: impl Into<String>) -> Self {
        self.arbiters.insert(Address::new(address));
        self
    }
}
