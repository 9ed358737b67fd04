//! This crate implements a policy-gated proxy re-encryption scheme for ride
//! matching, and the escrowed lifecycle of the ride requests it protects:
//! - a requester encrypts a ride request under a conjunction of attributes;
//! - an untrusted matcher re-encrypts it towards the provider it matched,
//! provided the provider attributes satisfy the policy, without learning the
//! plaintext;
//! - only the matched provider can decrypt the re-encrypted ciphertext, and
//! anyone can verify it was produced by the engine.
//!
//! The `core` module exposes the crypto engine, through the [`RideCrypt`]
//! object and the request/response `CryptoService` boundary.
//!
//! The `lifecycle` module sequences a request over a ledger, an opaque
//! store and a collateral escrow.
//!
//! # Example
//!
//! See `demos/runme.rs`.

mod error;

pub mod abe_policy;
pub mod collateral;
pub mod config;
pub mod core;
pub mod lifecycle;
pub mod store;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use error::{Error, ErrorKind, ErrorReport};

pub use self::core::{
    api::RideCrypt,
    service::{CryptoBoundary, CryptoRequest, CryptoResponse, CryptoService},
    Ciphertext, Digest, MasterSecretKey, PartyHandle, ReKey, ReencryptedCiphertext,
    SystemParameters, UserSecretKey,
};
