//! Ride request lifecycle.
//!
//! The ride record lives on a [`Ledger`]. Its legal moves are given by
//! [`Request::apply`], a pure function of the record, the sender and the
//! transition. [`Lifecycle`] orchestrates the ledger, the opaque store, the
//! crypto engine and the collateral manager around it.
//!
//! ```text
//! Requested -> Proposed -> Matched -> Reencrypted -> InProgress -> Completed
//!     |            |                                                  |
//!     +-> Cancelled+                     (any live status) -> Disputed -> Resolved
//! ```

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{core::Digest, Error};

mod ledger;
mod machine;
mod request;


pub use ledger::{
    Clock, Ledger, LedgerEvent, ManualClock, MemoryLedger, SystemClock, Transaction, TxReceipt,
};
pub use machine::{Lifecycle, MatchOutcome};
pub use request::{EventKind, Proposal, Rating, Request, Transition, TripTerms};

/// Amount of collateral, in the smallest unit of the payment rail.
pub type Amount = u64;

/// Seconds since the Unix epoch.
pub type Timestamp = u64;

/// Ledger address of a party. Never derived from, nor equal to, a
/// [`PartyHandle`](crate::core::PartyHandle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Identifier of a ride request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Derives the identifier of the request committing `ct_hash` on behalf
    /// of `requester`.
    #[must_use]
    pub fn derive(requester: &Address, ct_hash: &Digest) -> Self {
        let requester = requester.as_str().as_bytes();
        let digest = crate::sha3_256!(
            b"ride_crypt request id",
            &(requester.len() as u64).to_le_bytes(),
            requester,
            ct_hash.as_ref()
        );
        let mut id = [0; 8];
        id.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(id))
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| Error::ConversionFailed(format!("request id '{s}': {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Requested,
    Proposed,
    Matched,
    Reencrypted,
    InProgress,
    Completed,
    Disputed,
    Cancelled,
    Resolved,
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Proposed => "proposed",
            Self::Matched => "matched",
            Self::Reencrypted => "reencrypted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
            Self::Resolved => "resolved",
        };
        f.write_str(name)
    }
}

/// Side of a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Requester,
    Provider,
}
