//! Implements the policy-gated proxy re-encryption engine.
//!
//! A rider encrypts a ride request under an [`AccessPolicy`]. An engine
//! holding the [`MasterSecretKey`] issues a [`ReKey`] for a ciphertext and a
//! recipient identity once the recipient's attributes satisfy the policy.
//! Applying the re-key to the ciphertext yields a [`ReencryptedCiphertext`]
//! that only the recipient can open and that anyone holding the
//! [`SystemParameters`] can verify.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
};

use cosmian_crypto_core::{Aes256Gcm, R25519PrivateKey, R25519PublicKey, SymmetricKey};
use serde::{Deserialize, Serialize};

use crate::abe_policy::{AccessPolicy, AttributeToken};

#[macro_use]
pub mod macros;

pub mod api;
pub mod primitives;
pub mod serialization;
pub mod service;

#[cfg(test)]
mod tests;

/// Length of the per-ciphertext seed and of each row share.
pub const SEED_LENGTH: usize = 32;

/// Length of the KMAC key held by the engine.
pub const KMAC_KEY_LENGTH: usize = 32;

/// Length of the KMAC outputs (tags, handles, bindings).
pub const KMAC_LENGTH: usize = 32;

/// Length of the digests identifying artifacts.
pub const DIGEST_LENGTH: usize = 32;

pub const DEM_KEY_LENGTH: usize = Aes256Gcm::KEY_LENGTH;

pub const NONCE_LENGTH: usize = Aes256Gcm::NONCE_LENGTH;

pub(crate) type Share = [u8; SEED_LENGTH];
pub(crate) type KmacTag = [u8; KMAC_LENGTH];

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// SHA3-256 digest of a serialized artifact.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub(crate) [u8; DIGEST_LENGTH]);

impl Digest {
    /// Digest of the given bytes.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha3_256!(bytes))
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn to_bytes(&self) -> [u8; DIGEST_LENGTH] {
        self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

/// Pseudonymous transaction identifier (PTID).
///
/// Derived by the engine from a party's identity and a context so that the
/// same party gets unlinkable handles in different contexts. User keys and
/// re-encrypted ciphertexts are bound to a handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartyHandle(pub(crate) [u8; KMAC_LENGTH]);

impl PartyHandle {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KMAC_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn to_bytes(&self) -> [u8; KMAC_LENGTH] {
        self.0
    }
}

impl AsRef<[u8]> for PartyHandle {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for PartyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Debug for PartyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartyHandle({self})")
    }
}

/// Secret held by the re-encryption engine only.
#[derive(PartialEq, Eq)]
pub struct MasterSecretKey {
    /// Secret exponent of `h`.
    pub(crate) s: R25519PrivateKey,
    /// Signing key of the engine.
    pub(crate) v: R25519PrivateKey,
    pub(crate) kmac_key: SymmetricKey<KMAC_KEY_LENGTH>,
}

impl Debug for MasterSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecretKey(..)")
    }
}

/// Public parameters published at setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemParameters {
    /// Encryption point `h = g^s`.
    pub(crate) h: R25519PublicKey,
    /// Verification key `vk = g^v` of the engine signatures.
    pub(crate) vk: R25519PublicKey,
}

/// Secret key of a party, bound to its [`PartyHandle`].
///
/// Holds one secret per attribute the party was issued. The KMAC tag lets
/// the engine detect forged or altered keys.
#[derive(PartialEq, Eq)]
pub struct UserSecretKey {
    pub(crate) ptid: PartyHandle,
    pub(crate) binding: KmacTag,
    pub(crate) secrets: BTreeMap<AttributeToken, R25519PrivateKey>,
    pub(crate) tag: KmacTag,
}

impl UserSecretKey {
    #[must_use]
    pub fn ptid(&self) -> &PartyHandle {
        &self.ptid
    }

    /// Tokens of the attributes this key can open.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeToken> {
        self.secrets.keys()
    }
}

impl Debug for UserSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSecretKey")
            .field("ptid", &self.ptid)
            .field("attributes", &self.secrets.len())
            .finish_non_exhaustive()
    }
}

/// Schnorr signature of the engine over a re-encryption transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub(crate) r: R25519PublicKey,
    pub(crate) z: R25519PrivateKey,
}

/// Ciphertext of a ride request.
///
/// Row `i` of the policy carries the share `shares[i]`. The body is the
/// AEAD encryption of the plaintext under a key derived from the XOR of all
/// row shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub(crate) policy: AccessPolicy,
    pub(crate) c: R25519PublicKey,
    pub(crate) shares: Vec<Share>,
    pub(crate) nonce: [u8; NONCE_LENGTH],
    pub(crate) body: Vec<u8>,
    pub(crate) binding: KmacTag,
}

impl Ciphertext {
    #[must_use]
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Keyed commitment over the policy and the plaintext, checked at
    /// decryption to detect substitution.
    #[must_use]
    pub fn binding(&self) -> &[u8; KMAC_LENGTH] {
        &self.binding
    }
}

/// Re-encryption key for one `(ciphertext, recipient)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReKey {
    pub(crate) source: Digest,
    pub(crate) recipient: PartyHandle,
    pub(crate) rprime: R25519PublicKey,
    pub(crate) deltas: Vec<Share>,
    pub(crate) signature: Signature,
}

impl ReKey {
    #[must_use]
    pub fn source(&self) -> &Digest {
        &self.source
    }

    #[must_use]
    pub fn recipient(&self) -> &PartyHandle {
        &self.recipient
    }
}

/// Ciphertext re-encrypted for a single recipient.
///
/// It carries no material from which a re-key to a third party could be
/// derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReencryptedCiphertext {
    pub(crate) source: Digest,
    pub(crate) recipient: PartyHandle,
    pub(crate) policy: AccessPolicy,
    pub(crate) rprime: R25519PublicKey,
    pub(crate) shares: Vec<Share>,
    pub(crate) nonce: [u8; NONCE_LENGTH],
    pub(crate) body: Vec<u8>,
    pub(crate) binding: KmacTag,
    pub(crate) signature: Signature,
}

impl ReencryptedCiphertext {
    /// Digest of the ciphertext this one was re-encrypted from.
    #[must_use]
    pub fn source(&self) -> &Digest {
        &self.source
    }

    #[must_use]
    pub fn recipient(&self) -> &PartyHandle {
        &self.recipient
    }

    #[must_use]
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }
}
