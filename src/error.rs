//! Define this crate error type.

use std::{
    array::TryFromSliceError,
    fmt::{self, Display},
    num::TryFromIntError,
};

use cosmian_crypto_core::CryptoCoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::{RequestId, Status};

/// Crate error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),
    #[error("invalid boolean expression: {0}")]
    InvalidBooleanExpression(String),
    #[error("unsupported operator {0}")]
    UnsupportedOperator(String),
    #[error("insufficient collateral: {given} given, {required} required")]
    InsufficientCollateral { given: u64, required: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("attributes do not satisfy the access policy")]
    PolicyNotSatisfied,
    #[error("{0} is not an authorized matcher")]
    NotAuthorizedMatcher(String),
    #[error("{0} is not allowed to perform this transition")]
    NotAuthorized(String),
    #[error("key mismatch: {0}")]
    KeyMismatch(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("transition `{transition}` is illegal from status {from}")]
    InvalidTransition {
        from: Status,
        transition: &'static str,
    },
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),
    #[error("unknown or inactive proposal {index} on request {request}")]
    InvalidProposal { request: RequestId, index: usize },
    #[error("invalid rating: {0}")]
    InvalidRating(String),
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("store key {0} already exists")]
    StoreConflict(String),
    #[error("store key {0} not found")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    CryptoCoreError(CryptoCoreError),
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
    #[error("json parsing error: {0}")]
    JsonParsing(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], used by callers to decide whether
/// to retry and how to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller mistake, never retried.
    Input,
    /// Denied by policy or role, retrying reproduces the denial.
    Authorization,
    /// Integrity check failure, to be reported as a security event.
    Verification,
    /// Illegal transition for the current ledger state.
    State,
    /// Unavailable collaborator, safe to retry.
    Transient,
    /// Unrecoverable.
    Fatal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Authorization => "authorization",
            Self::Verification => "verification",
            Self::State => "state",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Structured `(kind, message)` pair returned to users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPolicy(_)
            | Self::InvalidAttributes(_)
            | Self::InvalidBooleanExpression(_)
            | Self::UnsupportedOperator(_)
            | Self::InsufficientCollateral { .. }
            | Self::InvalidConfig(_)
            | Self::InvalidRating(_)
            | Self::ConversionFailed(_)
            | Self::JsonParsing(_) => ErrorKind::Input,
            Self::PolicyNotSatisfied
            | Self::NotAuthorizedMatcher(_)
            | Self::NotAuthorized(_)
            | Self::KeyMismatch(_) => ErrorKind::Authorization,
            Self::VerificationFailed(_) | Self::CryptoCoreError(_) => ErrorKind::Verification,
            Self::InvalidTransition { .. }
            | Self::UnknownRequest(_)
            | Self::InvalidProposal { .. }
            | Self::Reverted(_)
            | Self::StoreConflict(_)
            | Self::NotFound(_) => ErrorKind::State,
            Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_) => ErrorKind::Transient,
            Self::Other(_) => ErrorKind::Fatal,
        }
    }

    /// Only transient failures are retried: every core crypto operation is
    /// deterministic, so replaying the same inputs is harmless.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    #[must_use]
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<CryptoCoreError> for Error {
    fn from(e: CryptoCoreError) -> Self {
        Self::CryptoCoreError(e)
    }
}

impl From<TryFromIntError> for Error {
    fn from(e: TryFromIntError) -> Self {
        Self::ConversionFailed(e.to_string())
    }
}

impl From<TryFromSliceError> for Error {
    fn from(e: TryFromSliceError) -> Self {
        Self::ConversionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::JsonParsing(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
