use base64::{engine::general_purpose::STANDARD, Engine};
use cosmian_crypto_core::bytes_ser_de::Serializable;
use serde::{Deserialize, Serialize};

use crate::{
    abe_policy::{AccessPolicy, AttributeSet},
    core::{
        api::RideCrypt, Ciphertext, MasterSecretKey, ReencryptedCiphertext, SystemParameters,
        UserSecretKey,
    },
    Error,
};

fn decode(data: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::ConversionFailed(format!("base64: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
struct UserKeyTestVector {
    identity: String,
    context: String,
    attributes: Vec<String>,
    key: String,
}

impl UserKeyTestVector {
    fn new(
        cc: &RideCrypt,
        msk: &MasterSecretKey,
        identity: &str,
        context: &str,
        attributes: &[&str],
    ) -> Result<Self, Error> {
        let ptid = cc.derive_ptid(msk, identity.as_bytes(), context.as_bytes());
        let usk = cc.keygen(msk, &AttributeSet::from_names(attributes.iter().copied())?, &ptid)?;
        Ok(Self {
            identity: identity.to_string(),
            context: context.to_string(),
            attributes: attributes.iter().map(ToString::to_string).collect(),
            key: STANDARD.encode(usk.serialize()?),
        })
    }

    fn attributes(&self) -> Result<AttributeSet, Error> {
        AttributeSet::from_names(self.attributes.iter().map(String::as_str))
    }

    fn key(&self) -> Result<UserSecretKey, Error> {
        UserSecretKey::deserialize(&decode(&self.key)?)
    }
}

/// Ciphertext with its re-encryption for one driver, or `None` if the
/// driver does not satisfy the policy.
#[derive(Debug, Serialize, Deserialize)]
struct ReencryptionTestVector {
    policy: String,
    plaintext: String,
    ciphertext: String,
    reencrypted: Option<String>,
}

impl ReencryptionTestVector {
    fn new(
        cc: &RideCrypt,
        msk: &MasterSecretKey,
        params: &SystemParameters,
        driver: &UserKeyTestVector,
        policy: &str,
        plaintext: &str,
    ) -> Result<Self, Error> {
        let ct = cc.encrypt(params, &AccessPolicy::parse(policy)?, plaintext.as_bytes())?;
        let usk = driver.key()?;
        let reencrypted = match cc.rekey(msk, &ct, usk.ptid(), &driver.attributes()?) {
            Ok(rk) => Some(STANDARD.encode(cc.reencrypt(&ct, &rk)?.serialize()?)),
            Err(Error::PolicyNotSatisfied) => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            policy: policy.to_string(),
            plaintext: STANDARD.encode(plaintext),
            ciphertext: STANDARD.encode(ct.serialize()?),
            reencrypted,
        })
    }

    /// Re-keying is deterministic: the stored re-encryption must be
    /// reproduced byte for byte.
    fn verify(
        &self,
        cc: &RideCrypt,
        msk: &MasterSecretKey,
        params: &SystemParameters,
        driver: &UserKeyTestVector,
    ) -> Result<(), Error> {
        let ct = Ciphertext::deserialize(&decode(&self.ciphertext)?)?;
        if ct.policy() != &AccessPolicy::parse(&self.policy)? {
            return Err(Error::InvalidPolicy(format!(
                "ciphertext policy differs from '{}'",
                self.policy
            )));
        }
        let usk = driver.key()?;
        let rk = cc.rekey(msk, &ct, usk.ptid(), &driver.attributes()?);
        let expected = match (&self.reencrypted, rk) {
            (Some(expected), Ok(rk)) => {
                let ctp = cc.reencrypt(&ct, &rk)?;
                let expected = decode(expected)?;
                if *ctp.serialize()? != expected {
                    return Err(Error::VerificationFailed(
                        "re-encryption is not reproducible".to_string(),
                    ));
                }
                ReencryptedCiphertext::deserialize(&expected)?
            }
            (None, Err(Error::PolicyNotSatisfied)) => return Ok(()),
            (None, Ok(_)) => {
                return Err(Error::VerificationFailed(format!(
                    "'{}' should not be satisfied",
                    self.policy
                )))
            }
            (_, Err(e)) => return Err(e),
        };
        let plaintext = cc.decrypt(params, &expected, &usk)?;
        if *plaintext != decode(&self.plaintext)? {
            return Err(Error::VerificationFailed(
                "decrypted plaintext differs".to_string(),
            ));
        }
        Ok(())
    }
}

/// Keys and ciphertexts produced by a setup, checked against a later build.
#[derive(Debug, Serialize, Deserialize)]
pub struct NonRegressionTestVector {
    master_secret_key: String,
    parameters: String,
    premium_driver: UserKeyTestVector,
    verified_pickup_vector: ReencryptionTestVector,
    premium_pickup_vector: ReencryptionTestVector,
    ev_pickup_vector: ReencryptionTestVector,
}

impl NonRegressionTestVector {
    pub fn new() -> Result<Self, Error> {
        let cc = RideCrypt::default();
        let (msk, params) = cc.setup()?;
        let premium_driver = UserKeyTestVector::new(
            &cc,
            &msk,
            "driver-1",
            "2026-10",
            &["verified", "premium", "licensed"],
        )?;

        Ok(Self {
            master_secret_key: STANDARD.encode(msk.serialize()?),
            parameters: STANDARD.encode(params.serialize()?),
            verified_pickup_vector: ReencryptionTestVector::new(
                &cc,
                &msk,
                &params,
                &premium_driver,
                "verified",
                "pickup=A,dest=B",
            )?,
            premium_pickup_vector: ReencryptionTestVector::new(
                &cc,
                &msk,
                &params,
                &premium_driver,
                "verified && (premium && licensed)",
                "pickup=C,dest=D,luggage=2",
            )?,
            ev_pickup_vector: ReencryptionTestVector::new(
                &cc,
                &msk,
                &params,
                &premium_driver,
                "verified && ev",
                "pickup=E,dest=F",
            )?,
            premium_driver,
        })
    }

    pub fn verify(&self) -> Result<(), Error> {
        let cc = RideCrypt::default();
        let msk = MasterSecretKey::deserialize(&decode(&self.master_secret_key)?)?;
        let params = SystemParameters::deserialize(&decode(&self.parameters)?)?;
        cc.verify_user_key(&msk, &self.premium_driver.key()?)?;

        if self.ev_pickup_vector.reencrypted.is_some() {
            return Err(Error::VerificationFailed(
                "ev vector should not be re-encrypted".to_string(),
            ));
        }
        for vector in [
            &self.verified_pickup_vector,
            &self.premium_pickup_vector,
            &self.ev_pickup_vector,
        ] {
            vector.verify(&cc, &msk, &params, &self.premium_driver)?;
        }
        Ok(())
    }
}

#[test]
fn test_generate_non_regression_vector() -> Result<(), Error> {
    let reg_vector = NonRegressionTestVector::new()?;
    std::fs::write(
        std::env::temp_dir().join("ride_crypt_non_regression_vector.json"),
        serde_json::to_string(&reg_vector)?,
    )?;
    Ok(())
}

#[test]
fn test_non_regression() -> Result<(), Error> {
    let json = serde_json::to_string(&NonRegressionTestVector::new()?)?;
    let reg_vector: NonRegressionTestVector = serde_json::from_str(&json)?;
    reg_vector.verify()?;

    // a vector from another setup is rejected
    let mut mixed: NonRegressionTestVector = serde_json::from_str(&json)?;
    mixed.premium_pickup_vector = NonRegressionTestVector::new()?.premium_pickup_vector;
    assert!(mixed.verify().is_err());
    Ok(())
}
