//! Request/response boundary of the crypto engine.
//!
//! The lifecycle drives the engine through [`CryptoBoundary`] so that the
//! engine can run in-process ([`CryptoService`]) or behind a remote call.
//! Key material crosses the boundary only as the output of `KeyGen`, and is
//! never logged. Decryption happens at the recipient, with
//! [`RideCrypt::decrypt`].

use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    abe_policy::{AccessPolicy, AttributeSet},
    core::{
        api::RideCrypt, Ciphertext, Digest, MasterSecretKey, PartyHandle, ReKey,
        ReencryptedCiphertext, SystemParameters, UserSecretKey, KMAC_LENGTH,
    },
    error::ErrorKind,
    Error,
};

pub enum CryptoRequest {
    Parameters,
    DerivePtid {
        identity: Vec<u8>,
        context: Vec<u8>,
    },
    KeyGen {
        attributes: AttributeSet,
        ptid: PartyHandle,
    },
    Encrypt {
        plaintext: Zeroizing<Vec<u8>>,
        policy: AccessPolicy,
    },
    Match {
        attributes: AttributeSet,
        policy: AccessPolicy,
    },
    ReKey {
        ct: Box<Ciphertext>,
        recipient: PartyHandle,
        attributes: AttributeSet,
    },
    ReEncrypt {
        ct: Box<Ciphertext>,
        rk: Box<ReKey>,
    },
    /// Verifies a re-encrypted ciphertext, and its source and recipient when
    /// given.
    Verify {
        ctp: Box<ReencryptedCiphertext>,
        expected: Option<(Digest, PartyHandle)>,
    },
}

impl CryptoRequest {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parameters => "parameters",
            Self::DerivePtid { .. } => "derive_ptid",
            Self::KeyGen { .. } => "keygen",
            Self::Encrypt { .. } => "encrypt",
            Self::Match { .. } => "match",
            Self::ReKey { .. } => "rekey",
            Self::ReEncrypt { .. } => "reencrypt",
            Self::Verify { .. } => "verify",
        }
    }
}

pub enum CryptoResponse {
    Parameters(SystemParameters),
    Ptid(PartyHandle),
    UserKeys(Box<UserSecretKey>),
    Encrypted {
        ct: Box<Ciphertext>,
        ct_hash: Digest,
        binding: [u8; KMAC_LENGTH],
    },
    Matched(bool),
    ReKey(Box<ReKey>),
    Reencrypted(Box<ReencryptedCiphertext>),
    Verified(bool),
}

impl CryptoResponse {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Parameters(_) => "parameters",
            Self::Ptid(_) => "ptid",
            Self::UserKeys(_) => "user_keys",
            Self::Encrypted { .. } => "encrypted",
            Self::Matched(_) => "matched",
            Self::ReKey(_) => "rekey",
            Self::Reencrypted(_) => "reencrypted",
            Self::Verified(_) => "verified",
        }
    }

    /// Error returned when a response does not answer the request sent.
    #[must_use]
    pub fn unexpected(&self, expected: &str) -> Error {
        Error::Other(format!(
            "crypto boundary answered `{}` to a `{expected}` request",
            self.name()
        ))
    }
}

/// Request/response access to a crypto engine.
///
/// Implementations report unavailability and timeouts with
/// [`Error::Unavailable`] and [`Error::Timeout`]; callers retry those.
pub trait CryptoBoundary: Send + Sync {
    fn call(&self, request: CryptoRequest) -> Result<CryptoResponse, Error>;
}

impl<T: CryptoBoundary + ?Sized> CryptoBoundary for std::sync::Arc<T> {
    fn call(&self, request: CryptoRequest) -> Result<CryptoResponse, Error> {
        (**self).call(request)
    }
}

/// In-process engine holding the master secret key.
pub struct CryptoService {
    engine: RideCrypt,
    msk: MasterSecretKey,
    params: SystemParameters,
}

impl CryptoService {
    /// Runs the setup and keeps its output.
    pub fn setup(engine: RideCrypt) -> Result<Self, Error> {
        let (msk, params) = engine.setup()?;
        Ok(Self {
            engine,
            msk,
            params,
        })
    }

    /// Wraps keys produced by an earlier setup.
    #[must_use]
    pub fn from_keys(engine: RideCrypt, msk: MasterSecretKey, params: SystemParameters) -> Self {
        Self {
            engine,
            msk,
            params,
        }
    }

    #[must_use]
    pub fn params(&self) -> &SystemParameters {
        &self.params
    }

    #[must_use]
    pub fn engine(&self) -> &RideCrypt {
        &self.engine
    }
}

impl CryptoBoundary for CryptoService {
    fn call(&self, request: CryptoRequest) -> Result<CryptoResponse, Error> {
        debug!(operation = request.name(), "crypto call");
        let response = match request {
            CryptoRequest::Parameters => CryptoResponse::Parameters(self.params.clone()),
            CryptoRequest::DerivePtid { identity, context } => CryptoResponse::Ptid(
                self.engine.derive_ptid(&self.msk, &identity, &context),
            ),
            CryptoRequest::KeyGen { attributes, ptid } => CryptoResponse::UserKeys(Box::new(
                self.engine.keygen(&self.msk, &attributes, &ptid)?,
            )),
            CryptoRequest::Encrypt { plaintext, policy } => {
                let ct = self.engine.encrypt(&self.params, &policy, &plaintext)?;
                CryptoResponse::Encrypted {
                    ct_hash: ct.digest()?,
                    binding: *ct.binding(),
                    ct: Box::new(ct),
                }
            }
            CryptoRequest::Match { attributes, policy } => {
                CryptoResponse::Matched(self.engine.match_policy(&policy, &attributes))
            }
            CryptoRequest::ReKey {
                ct,
                recipient,
                attributes,
            } => CryptoResponse::ReKey(Box::new(self.engine.rekey(
                &self.msk,
                &ct,
                &recipient,
                &attributes,
            )?)),
            CryptoRequest::ReEncrypt { ct, rk } => {
                CryptoResponse::Reencrypted(Box::new(self.engine.reencrypt(&ct, &rk)?))
            }
            CryptoRequest::Verify { ctp, expected } => {
                let res = match expected {
                    Some((source, recipient)) => {
                        self.engine
                            .verify_for(&self.params, &ctp, &source, &recipient)
                    }
                    None => self.engine.verify(&self.params, &ctp),
                };
                match res {
                    Ok(()) => CryptoResponse::Verified(true),
                    Err(e)
                        if matches!(e.kind(), ErrorKind::Verification | ErrorKind::Authorization) =>
                    {
                        CryptoResponse::Verified(false)
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(response)
    }
}
