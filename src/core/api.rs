use std::sync::{Mutex, MutexGuard};

use cosmian_crypto_core::{reexport::rand_core::SeedableRng, CsRng};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::primitives::{self, verify_user_key_kmac};
use crate::{
    abe_policy::{AccessPolicy, AttributeSet},
    core::{
        Ciphertext, Digest, MasterSecretKey, PartyHandle, ReKey, ReencryptedCiphertext,
        SystemParameters, UserSecretKey,
    },
    Error,
};

/// Entry point of the re-encryption engine.
///
/// Only [`Self::setup`] and [`Self::encrypt`] draw randomness; every other
/// operation is a deterministic function of its inputs, which makes retries
/// safe.
#[derive(Debug)]
pub struct RideCrypt {
    rng: Mutex<CsRng>,
}

impl Default for RideCrypt {
    fn default() -> Self {
        Self {
            rng: Mutex::new(CsRng::from_entropy()),
        }
    }
}

impl PartialEq for RideCrypt {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl RideCrypt {
    /// Creates an engine drawing its randomness from the given seed.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: Mutex::new(CsRng::from_seed(seed)),
        }
    }

    fn rng(&self) -> Result<MutexGuard<CsRng>, Error> {
        self.rng
            .lock()
            .map_err(|e| Error::Other(format!("poisoned random generator: {e}")))
    }

    /// Generates the master secret key and the public parameters.
    pub fn setup(&self) -> Result<(MasterSecretKey, SystemParameters), Error> {
        Ok(primitives::setup(&mut *self.rng()?))
    }

    /// Derives the pseudonymous handle of `identity` in `context`.
    #[must_use]
    pub fn derive_ptid(
        &self,
        msk: &MasterSecretKey,
        identity: &[u8],
        context: &[u8],
    ) -> PartyHandle {
        primitives::derive_ptid(msk, identity, context)
    }

    /// Issues the key of `ptid` for the given attributes.
    ///
    /// - `msk`         : master secret key
    /// - `attributes`  : attributes of the party, at least one
    /// - `ptid`        : handle the key is bound to
    pub fn keygen(
        &self,
        msk: &MasterSecretKey,
        attributes: &AttributeSet,
        ptid: &PartyHandle,
    ) -> Result<UserSecretKey, Error> {
        let usk = primitives::keygen(msk, attributes, ptid)?;
        debug!(ptid = %ptid, attributes = attributes.len(), "issued user key");
        Ok(usk)
    }

    /// Checks the integrity tag of the given user key.
    pub fn verify_user_key(&self, msk: &MasterSecretKey, usk: &UserSecretKey) -> Result<(), Error> {
        verify_user_key_kmac(msk, usk)
    }

    /// Encrypts the plaintext under the given policy.
    pub fn encrypt(
        &self,
        params: &SystemParameters,
        policy: &AccessPolicy,
        plaintext: &[u8],
    ) -> Result<Ciphertext, Error> {
        primitives::encrypt(&mut *self.rng()?, params, policy, plaintext)
    }

    /// Returns true iff the attributes satisfy the policy.
    #[must_use]
    pub fn match_policy(&self, policy: &AccessPolicy, attributes: &AttributeSet) -> bool {
        policy.is_satisfied_by(attributes)
    }

    /// Issues the re-key of `ct` for `ptid`, provided the attributes satisfy
    /// the ciphertext policy.
    pub fn rekey(
        &self,
        msk: &MasterSecretKey,
        ct: &Ciphertext,
        ptid: &PartyHandle,
        attributes: &AttributeSet,
    ) -> Result<ReKey, Error> {
        primitives::rekey(msk, ct, ptid, attributes).map_err(|e| {
            if matches!(e, Error::PolicyNotSatisfied) {
                debug!(recipient = %ptid, "re-key denied");
            }
            e
        })
    }

    pub fn reencrypt(&self, ct: &Ciphertext, rk: &ReKey) -> Result<ReencryptedCiphertext, Error> {
        primitives::reencrypt(ct, rk)
    }

    /// Verifies the engine signature over a re-encrypted ciphertext.
    pub fn verify(
        &self,
        params: &SystemParameters,
        ctp: &ReencryptedCiphertext,
    ) -> Result<(), Error> {
        primitives::verify(params, ctp).map_err(|e| {
            warn!(
                source = %ctp.source(),
                recipient = %ctp.recipient(),
                "re-encryption verification failed"
            );
            e
        })
    }

    /// Verifies the re-encrypted ciphertext and checks it was produced from
    /// `source` for `recipient`.
    pub fn verify_for(
        &self,
        params: &SystemParameters,
        ctp: &ReencryptedCiphertext,
        source: &Digest,
        recipient: &PartyHandle,
    ) -> Result<(), Error> {
        self.verify(params, ctp)?;
        if ctp.source() != source {
            return Err(Error::KeyMismatch(format!(
                "re-encrypted from {}, expected {source}",
                ctp.source()
            )));
        }
        if ctp.recipient() != recipient {
            return Err(Error::KeyMismatch(format!(
                "re-encrypted for {}, expected {recipient}",
                ctp.recipient()
            )));
        }
        Ok(())
    }

    /// Verifies and decrypts the re-encrypted ciphertext with the key of its
    /// recipient.
    pub fn decrypt(
        &self,
        params: &SystemParameters,
        ctp: &ReencryptedCiphertext,
        usk: &UserSecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, Error> {
        primitives::decrypt(params, ctp, usk)
    }
}
