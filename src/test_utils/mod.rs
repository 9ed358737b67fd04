//! Helpers shared by the tests, the benches and the demo.

use crate::{
    abe_policy::AttributeSet,
    core::{api::RideCrypt, MasterSecretKey, PartyHandle, SystemParameters, UserSecretKey},
    Error,
};

pub mod non_regression;

/// Runs the setup and issues the key of a driver holding `attributes`.
pub fn driver_keygen(
    cc: &RideCrypt,
    identity: &[u8],
    attributes: &[&str],
) -> Result<(MasterSecretKey, SystemParameters, PartyHandle, UserSecretKey), Error> {
    let (msk, params) = cc.setup()?;
    let ptid = cc.derive_ptid(&msk, identity, b"ride_crypt test");
    let usk = cc.keygen(&msk, &AttributeSet::from_names(attributes.iter().copied())?, &ptid)?;
    Ok((msk, params, ptid, usk))
}

#[cfg(test)]
mod tests {
    use cosmian_crypto_core::bytes_ser_de::Serializable;

    use super::*;
    use crate::abe_policy::{premium_driver, AccessPolicy};

    /// The setup is persisted once: ciphertexts produced before a restart
    /// can still be re-encrypted after it.
    #[test]
    fn test_persisted_setup() -> Result<(), Error> {
        let cc = RideCrypt::default();
        let (msk, params, ptid, usk) =
            driver_keygen(&cc, b"driver", &["verified", "premium", "licensed"])?;
        let ct = cc.encrypt(&params, &AccessPolicy::parse("premium && verified")?, b"ride")?;

        let msk = MasterSecretKey::deserialize(&msk.serialize()?)?;
        let params = SystemParameters::deserialize(&params.serialize()?)?;
        let usk = UserSecretKey::deserialize(&usk.serialize()?)?;
        cc.verify_user_key(&msk, &usk)?;
        assert_eq!(cc.derive_ptid(&msk, b"driver", b"ride_crypt test"), ptid);

        let ctp = cc.reencrypt(&ct, &cc.rekey(&msk, &ct, &ptid, &premium_driver()?)?)?;
        assert_eq!(&**cc.decrypt(&params, &ctp, &usk)?, b"ride");
        Ok(())
    }

    #[test]
    fn test_seeded_engine() -> Result<(), Error> {
        let (msk1, params1, ptid1, _) =
            driver_keygen(&RideCrypt::from_seed([7; 32]), b"driver", &["verified"])?;
        let (msk2, params2, ptid2, _) =
            driver_keygen(&RideCrypt::from_seed([7; 32]), b"driver", &["verified"])?;
        assert_eq!(msk1, msk2);
        assert_eq!(params1, params2);
        assert_eq!(ptid1, ptid2);

        let (_, params3, _, _) = driver_keygen(&RideCrypt::default(), b"driver", &["verified"])?;
        assert_ne!(params1, params3);
        Ok(())
    }
}
