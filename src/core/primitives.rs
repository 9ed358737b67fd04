//! Implements the cryptographic primitives of the re-encryption engine.
//!
//! Each ciphertext splits a random seed `K` into one XOR share per policy
//! row. Share `i` is masked with a key derived from `h^r` and stored next to
//! `c = g^r`. A re-key replaces, row by row, the mask derived from `h^r` by
//! a mask only the recipient can compute from its attribute secret and
//! `R' = g^t`. The seed never appears in clear outside of encryption and
//! decryption.

use std::collections::BTreeMap;

use cosmian_crypto_core::{
    kdf256,
    reexport::rand_core::{CryptoRngCore, SeedableRng},
    Aes256Gcm, CsRng, Dem, FixedSizeCBytes, Instantiable, Nonce, R25519PrivateKey,
    R25519PublicKey, RandomFixedSizeCBytes, SymmetricKey,
};
use tiny_keccak::{Hasher, IntoXof, Kmac, Sha3, Xof};
use tracing::debug;
use zeroize::Zeroizing;

use super::{
    Ciphertext, Digest, KmacTag, MasterSecretKey, PartyHandle, ReKey, ReencryptedCiphertext,
    Share, Signature, SystemParameters, UserSecretKey, DEM_KEY_LENGTH, KMAC_KEY_LENGTH,
    KMAC_LENGTH, NONCE_LENGTH, SEED_LENGTH,
};
use crate::{
    abe_policy::{AccessPolicy, AttributeSet, AttributeToken},
    Error,
};

const PTID_INFO: &[u8] = b"ptid";
const PTID_BINDING_INFO: &[u8] = b"ptid binding";
const ATTRIBUTE_SECRET_INFO: &[u8] = b"attribute secret";
const POLICY_MASK_INFO: &[u8] = b"policy mask";
const RECIPIENT_MASK_INFO: &[u8] = b"recipient mask";
const REKEY_INFO: &[u8] = b"re-key exponent";
const DEM_KEY_INFO: &[u8] = b"dem key";
const PLAINTEXT_BINDING_INFO: &[u8] = b"plaintext binding";
const SIGNATURE_NONCE_INFO: &[u8] = b"signature nonce";
const SIGNATURE_CHALLENGE_INFO: &[u8] = b"signature challenge";
const TRANSCRIPT_INFO: &[u8] = b"re-encryption transcript";

/// Xor the two given byte arrays in place.
fn xor_in_place<const LENGTH: usize>(a: &mut [u8; LENGTH], b: &[u8; LENGTH]) {
    for (a_i, b_i) in a.iter_mut().zip(b.iter()) {
        *a_i ^= b_i;
    }
}

/// Maps the given seed to a scalar.
///
/// The scalar is drawn from a CSPRNG seeded with `seed`, hence uniformly
/// distributed and fully determined by the seed.
fn hash_to_scalar(seed: [u8; 32]) -> R25519PrivateKey {
    R25519PrivateKey::new(&mut CsRng::from_seed(seed))
}

fn row_index(row: usize) -> [u8; 8] {
    (row as u64).to_le_bytes()
}

/// Mask of the share of row `row` in an original ciphertext.
fn policy_mask(
    z: &R25519PublicKey,
    policy_digest: &[u8],
    row: usize,
    token: &AttributeToken,
) -> Share {
    let mut mask = [0; SEED_LENGTH];
    kdf256!(
        &mut mask,
        POLICY_MASK_INFO,
        &z.to_bytes(),
        policy_digest,
        &row_index(row),
        token.as_ref()
    );
    mask
}

/// Mask of the share of row `row` in a re-encrypted ciphertext.
///
/// `point` is `Y_a^t` on the engine side and `R'^y_a` on the recipient side.
fn recipient_mask(
    point: &R25519PublicKey,
    source: &Digest,
    row: usize,
    token: &AttributeToken,
    recipient: &PartyHandle,
) -> Share {
    let mut mask = [0; SEED_LENGTH];
    kdf256!(
        &mut mask,
        RECIPIENT_MASK_INFO,
        &point.to_bytes(),
        source.as_ref(),
        &row_index(row),
        token.as_ref(),
        recipient.as_ref()
    );
    mask
}

/// Derives the DEM key and the plaintext binding key from the seed.
fn derive_keys(
    seed: &[u8; SEED_LENGTH],
) -> Result<(SymmetricKey<DEM_KEY_LENGTH>, Zeroizing<[u8; KMAC_KEY_LENGTH]>), Error> {
    let mut dem_key = Zeroizing::new([0; DEM_KEY_LENGTH]);
    kdf256!(&mut *dem_key, DEM_KEY_INFO, seed);
    let mut binding_key = Zeroizing::new([0; KMAC_KEY_LENGTH]);
    kdf256!(&mut *binding_key, PLAINTEXT_BINDING_INFO, seed);
    Ok((SymmetricKey::try_from_bytes(*dem_key)?, binding_key))
}

fn plaintext_binding(binding_key: &[u8], policy_digest: &[u8], plaintext: &[u8]) -> KmacTag {
    kmac!(KMAC_LENGTH, binding_key, policy_digest, plaintext)
}

/// Binding of a user key to its handle.
fn ptid_binding(ptid: &PartyHandle) -> KmacTag {
    sha3_256!(PTID_BINDING_INFO, ptid.as_ref())
}

/// Secret of the attribute `token` for the holder of `ptid`.
fn attribute_secret(
    msk: &MasterSecretKey,
    token: &AttributeToken,
    ptid: &PartyHandle,
) -> R25519PrivateKey {
    hash_to_scalar(kmac!(
        32,
        &msk.kmac_key,
        ATTRIBUTE_SECRET_INFO,
        token.as_ref(),
        ptid.as_ref()
    ))
}

/// Computes the KMAC of the given user key.
/// The attribute secrets are processed in token order.
fn compute_user_key_kmac(msk: &MasterSecretKey, usk: &UserSecretKey) -> KmacTag {
    let mut kmac = Kmac::v256(&msk.kmac_key, usk.ptid.as_ref());
    kmac.update(&usk.binding);
    for (token, y) in &usk.secrets {
        kmac.update(token.as_ref());
        kmac.update(&y.to_bytes());
    }
    let mut res = [0; KMAC_LENGTH];
    kmac.into_xof().squeeze(&mut res);
    res
}

/// Checks that the provided KMAC matches the user key content.
pub fn verify_user_key_kmac(msk: &MasterSecretKey, usk: &UserSecretKey) -> Result<(), Error> {
    if usk.tag != compute_user_key_kmac(msk, usk) {
        return Err(Error::VerificationFailed(
            "the provided user key is corrupted".to_string(),
        ));
    }
    Ok(())
}

/// Digest of everything the engine signs when issuing a re-key.
#[allow(clippy::too_many_arguments)]
fn transcript(
    source: &Digest,
    recipient: &PartyHandle,
    rprime: &R25519PublicKey,
    policy: &AccessPolicy,
    shares: &[Share],
    nonce: &[u8; NONCE_LENGTH],
    body: &[u8],
    binding: &KmacTag,
) -> [u8; 32] {
    let mut hasher = Sha3::v256();
    hasher.update(TRANSCRIPT_INFO);
    hasher.update(source.as_ref());
    hasher.update(recipient.as_ref());
    hasher.update(&rprime.to_bytes());
    hasher.update(&policy.digest());
    hasher.update(&(shares.len() as u64).to_le_bytes());
    for share in shares {
        hasher.update(share);
    }
    hasher.update(nonce);
    hasher.update(&(body.len() as u64).to_le_bytes());
    hasher.update(body);
    hasher.update(binding);
    let mut res = [0; 32];
    hasher.finalize(&mut res);
    res
}

fn challenge(r: &R25519PublicKey, vk: &R25519PublicKey, message: &[u8]) -> R25519PrivateKey {
    hash_to_scalar(sha3_256!(
        SIGNATURE_CHALLENGE_INFO,
        &r.to_bytes(),
        &vk.to_bytes(),
        message
    ))
}

/// Deterministic Schnorr signature: the nonce is derived from the engine
/// KMAC key and the message.
fn sign(msk: &MasterSecretKey, message: &[u8]) -> Signature {
    let k = hash_to_scalar(kmac!(32, &msk.kmac_key, SIGNATURE_NONCE_INFO, message));
    let r = R25519PublicKey::from(&k);
    let vk = R25519PublicKey::from(&msk.v);
    let c = challenge(&r, &vk, message);
    let z = &k + &(&c * &msk.v);
    Signature { r, z }
}

fn verify_signature(vk: &R25519PublicKey, message: &[u8], signature: &Signature) -> bool {
    let c = challenge(&signature.r, vk, message);
    R25519PublicKey::from(&signature.z) == &signature.r + &(vk * &c)
}

/// Generates the engine master secret key and the public parameters.
pub fn setup(rng: &mut impl CryptoRngCore) -> (MasterSecretKey, SystemParameters) {
    let s = R25519PrivateKey::new(rng);
    let v = R25519PrivateKey::new(rng);
    let kmac_key = SymmetricKey::<KMAC_KEY_LENGTH>::new(rng);
    let params = SystemParameters {
        h: R25519PublicKey::from(&s),
        vk: R25519PublicKey::from(&v),
    };
    (MasterSecretKey { s, v, kmac_key }, params)
}

/// Derives the handle of a party in a given context.
///
/// Both inputs are length-prefixed so that no two `(identity, context)`
/// pairs share an encoding.
pub fn derive_ptid(msk: &MasterSecretKey, identity: &[u8], context: &[u8]) -> PartyHandle {
    PartyHandle(kmac!(
        KMAC_LENGTH,
        &msk.kmac_key,
        PTID_INFO,
        &(identity.len() as u64).to_le_bytes(),
        identity,
        &(context.len() as u64).to_le_bytes(),
        context
    ))
}

/// Generates the secret key of the party `ptid` for the given attributes.
///
/// Key generation is deterministic: issuing the same attributes to the same
/// handle twice yields the same key.
pub fn keygen(
    msk: &MasterSecretKey,
    attributes: &AttributeSet,
    ptid: &PartyHandle,
) -> Result<UserSecretKey, Error> {
    if attributes.is_empty() {
        return Err(Error::InvalidAttributes(
            "a user key needs at least one attribute".to_string(),
        ));
    }
    let secrets = attributes
        .iter()
        .map(|token| (*token, attribute_secret(msk, token, ptid)))
        .collect::<BTreeMap<_, _>>();
    let mut usk = UserSecretKey {
        ptid: *ptid,
        binding: ptid_binding(ptid),
        secrets,
        tag: [0; KMAC_LENGTH],
    };
    usk.tag = compute_user_key_kmac(msk, &usk);
    Ok(usk)
}

/// Encrypts the given plaintext under the given policy.
pub fn encrypt(
    rng: &mut impl CryptoRngCore,
    params: &SystemParameters,
    policy: &AccessPolicy,
    plaintext: &[u8],
) -> Result<Ciphertext, Error> {
    if policy.is_empty() {
        return Err(Error::InvalidPolicy(
            "cannot encrypt for an empty policy".to_string(),
        ));
    }

    let mut seed = Zeroizing::new([0; SEED_LENGTH]);
    rng.fill_bytes(&mut *seed);

    // n - 1 random shares, the last one closes the XOR to the seed
    let mut shares = Vec::with_capacity(policy.len());
    let mut last = Zeroizing::new(*seed);
    for _ in 1..policy.len() {
        let mut k_i = [0; SEED_LENGTH];
        rng.fill_bytes(&mut k_i);
        xor_in_place(&mut last, &k_i);
        shares.push(k_i);
    }
    shares.push(*last);

    let r = R25519PrivateKey::new(rng);
    let c = R25519PublicKey::from(&r);
    let z = &params.h * &r;
    let policy_digest = policy.digest();
    for (row, (token, share)) in policy.rows().iter().zip(shares.iter_mut()).enumerate() {
        xor_in_place(share, &policy_mask(&z, &policy_digest, row, token));
    }

    let (key, binding_key) = derive_keys(&seed)?;
    let nonce = Nonce::<NONCE_LENGTH>::new(&mut *rng);
    let body = Aes256Gcm::new(&key).encrypt(&nonce, plaintext, Some(policy_digest.as_slice()))?;
    let binding = plaintext_binding(&*binding_key, &policy_digest, plaintext);

    Ok(Ciphertext {
        policy: policy.clone(),
        c,
        shares,
        nonce: nonce.as_bytes().try_into()?,
        body,
        binding,
    })
}

/// Issues the re-key of the given ciphertext for the party `ptid`.
///
/// Fails with [`Error::PolicyNotSatisfied`] when the attributes do not
/// satisfy the ciphertext policy. The re-key is a deterministic function of
/// its inputs.
pub fn rekey(
    msk: &MasterSecretKey,
    ct: &Ciphertext,
    ptid: &PartyHandle,
    attributes: &AttributeSet,
) -> Result<ReKey, Error> {
    if !ct.policy.is_satisfied_by(attributes) {
        return Err(Error::PolicyNotSatisfied);
    }
    let source = ct.digest()?;
    let policy_digest = ct.policy.digest();
    let z = &ct.c * &msk.s;
    let t = hash_to_scalar(kmac!(
        32,
        &msk.kmac_key,
        REKEY_INFO,
        source.as_ref(),
        ptid.as_ref()
    ));
    let rprime = R25519PublicKey::from(&t);

    let mut deltas = Vec::with_capacity(ct.policy.len());
    let mut shares = Vec::with_capacity(ct.policy.len());
    for (row, (token, e_i)) in ct.policy.rows().iter().zip(&ct.shares).enumerate() {
        let y_point = R25519PublicKey::from(&attribute_secret(msk, token, ptid));
        let mut delta = policy_mask(&z, &policy_digest, row, token);
        xor_in_place(
            &mut delta,
            &recipient_mask(&(&y_point * &t), &source, row, token, ptid),
        );
        let mut e_prime = *e_i;
        xor_in_place(&mut e_prime, &delta);
        deltas.push(delta);
        shares.push(e_prime);
    }

    let message = transcript(
        &source,
        ptid,
        &rprime,
        &ct.policy,
        &shares,
        &ct.nonce,
        &ct.body,
        &ct.binding,
    );
    debug!(ct = %source, recipient = %ptid, rows = deltas.len(), "issued re-key");
    Ok(ReKey {
        source,
        recipient: *ptid,
        rprime,
        deltas,
        signature: sign(msk, &message),
    })
}

/// Applies the re-key to the ciphertext.
///
/// Only public material is used: the proxy never learns the seed nor the
/// plaintext.
pub fn reencrypt(ct: &Ciphertext, rk: &ReKey) -> Result<ReencryptedCiphertext, Error> {
    if rk.source != ct.digest()? {
        return Err(Error::KeyMismatch(
            "the re-key was issued for another ciphertext".to_string(),
        ));
    }
    if rk.deltas.len() != ct.shares.len() {
        return Err(Error::KeyMismatch(format!(
            "the re-key has {} rows, the ciphertext {}",
            rk.deltas.len(),
            ct.shares.len()
        )));
    }
    let shares = ct
        .shares
        .iter()
        .zip(&rk.deltas)
        .map(|(e_i, delta)| {
            let mut e_prime = *e_i;
            xor_in_place(&mut e_prime, delta);
            e_prime
        })
        .collect();
    Ok(ReencryptedCiphertext {
        source: rk.source,
        recipient: rk.recipient,
        policy: ct.policy.clone(),
        rprime: rk.rprime.clone(),
        shares,
        nonce: ct.nonce,
        body: ct.body.clone(),
        binding: ct.binding,
        signature: rk.signature.clone(),
    })
}

/// Checks the engine signature of the given re-encrypted ciphertext.
pub fn verify(params: &SystemParameters, ctp: &ReencryptedCiphertext) -> Result<(), Error> {
    if ctp.shares.len() != ctp.policy.len() {
        return Err(Error::VerificationFailed(
            "share count does not match the policy".to_string(),
        ));
    }
    let message = transcript(
        &ctp.source,
        &ctp.recipient,
        &ctp.rprime,
        &ctp.policy,
        &ctp.shares,
        &ctp.nonce,
        &ctp.body,
        &ctp.binding,
    );
    if verify_signature(&params.vk, &message, &ctp.signature) {
        Ok(())
    } else {
        Err(Error::VerificationFailed(
            "invalid re-encryption signature".to_string(),
        ))
    }
}

/// Verifies and decrypts the given re-encrypted ciphertext.
pub fn decrypt(
    params: &SystemParameters,
    ctp: &ReencryptedCiphertext,
    usk: &UserSecretKey,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    verify(params, ctp)?;
    if usk.ptid != ctp.recipient {
        return Err(Error::KeyMismatch(
            "the ciphertext was re-encrypted for another party".to_string(),
        ));
    }
    if usk.binding != ptid_binding(&usk.ptid) {
        return Err(Error::KeyMismatch(
            "the user key is not bound to its handle".to_string(),
        ));
    }

    let mut seed = Zeroizing::new([0; SEED_LENGTH]);
    for (row, (token, e_prime)) in ctp.policy.rows().iter().zip(&ctp.shares).enumerate() {
        let y = usk.secrets.get(token).ok_or(Error::PolicyNotSatisfied)?;
        let mut k_i = Zeroizing::new(*e_prime);
        xor_in_place(
            &mut k_i,
            &recipient_mask(&(&ctp.rprime * y), &ctp.source, row, token, &usk.ptid),
        );
        xor_in_place(&mut seed, &k_i);
    }

    let policy_digest = ctp.policy.digest();
    let (key, binding_key) = derive_keys(&seed)?;
    let nonce = Nonce::try_from_slice(&ctp.nonce)?;
    let plaintext = Aes256Gcm::new(&key)
        .decrypt(&nonce, &ctp.body, Some(policy_digest.as_slice()))
        .map(Zeroizing::new)
        .map_err(|_| Error::VerificationFailed("authenticated decryption failed".to_string()))?;
    if plaintext_binding(&*binding_key, &policy_digest, &plaintext) != ctp.binding {
        return Err(Error::VerificationFailed(
            "plaintext binding mismatch".to_string(),
        ));
    }
    Ok(plaintext)
}
