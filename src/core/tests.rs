use cosmian_crypto_core::bytes_ser_de::Serializable;

use crate::{
    abe_policy::{gen_policy, premium_driver, standard_driver, AccessPolicy, AttributeSet},
    core::{
        api::RideCrypt,
        service::{CryptoBoundary, CryptoRequest, CryptoResponse, CryptoService},
    },
    Error,
};

const RIDE: &[u8] = b"pickup=A,dest=B";

/// Encrypting, re-keying for a satisfying party, re-encrypting and
/// decrypting gives back the plaintext, whatever the number of rows.
#[test]
fn test_round_trip() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let attributes = AttributeSet::from_names(["verified", "premium", "licensed", "ev"])?;
    let ptid = cc.derive_ptid(&msk, b"driver-1", b"ride-7");
    let usk = cc.keygen(&msk, &attributes, &ptid)?;

    for policy in [
        AccessPolicy::parse("verified")?,
        AccessPolicy::parse("verified && premium")?,
        AccessPolicy::parse("licensed && (ev && verified) && premium")?,
    ] {
        let ct = cc.encrypt(&params, &policy, RIDE)?;
        let rk = cc.rekey(&msk, &ct, &ptid, &attributes)?;
        let ctp = cc.reencrypt(&ct, &rk)?;
        cc.verify(&params, &ctp)?;
        cc.verify_for(&params, &ctp, &ct.digest()?, &ptid)?;
        assert_eq!(&**cc.decrypt(&params, &ctp, &usk)?, RIDE);
    }

    // empty plaintext
    let ct = cc.encrypt(&params, &gen_policy()?, b"")?;
    let ctp = cc.reencrypt(&ct, &cc.rekey(&msk, &ct, &ptid, &attributes)?)?;
    assert!(cc.decrypt(&params, &ctp, &usk)?.is_empty());
    Ok(())
}

#[test]
fn test_policy_not_satisfied() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let policy = gen_policy()?;
    let ct = cc.encrypt(&params, &policy, RIDE)?;
    let ptid = cc.derive_ptid(&msk, b"driver-2", b"ride-7");

    assert!(cc.match_policy(&policy, &premium_driver()?));
    assert!(!cc.match_policy(&policy, &standard_driver()?));
    assert!(matches!(
        cc.rekey(&msk, &ct, &ptid, &standard_driver()?),
        Err(Error::PolicyNotSatisfied)
    ));

    // a key lacking one row attribute cannot open a CT' even if the re-key
    // was (wrongly) issued
    let rk = cc.rekey(&msk, &ct, &ptid, &premium_driver()?)?;
    let ctp = cc.reencrypt(&ct, &rk)?;
    let usk = cc.keygen(&msk, &standard_driver()?, &ptid)?;
    assert!(matches!(
        cc.decrypt(&params, &ctp, &usk),
        Err(Error::PolicyNotSatisfied)
    ));
    Ok(())
}

/// A CT' is bound to its recipient: another party holding the same
/// attributes cannot open it, even when claiming the right handle.
#[test]
fn test_recipient_binding() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let attributes = premium_driver()?;
    let alice = cc.derive_ptid(&msk, b"alice", b"ride-7");
    let bob = cc.derive_ptid(&msk, b"bob", b"ride-7");
    let bob_key = cc.keygen(&msk, &attributes, &bob)?;

    let ct = cc.encrypt(&params, &gen_policy()?, RIDE)?;
    let ctp = cc.reencrypt(&ct, &cc.rekey(&msk, &ct, &alice, &attributes)?)?;

    assert!(matches!(
        cc.decrypt(&params, &ctp, &bob_key),
        Err(Error::KeyMismatch(_))
    ));
    assert!(matches!(
        cc.verify_for(&params, &ctp, &ct.digest()?, &bob),
        Err(Error::KeyMismatch(_))
    ));

    // relabelling the CT' for bob breaks the signature
    let mut forged = ctp.clone();
    forged.recipient = bob;
    assert!(matches!(
        cc.verify(&params, &forged),
        Err(Error::VerificationFailed(_))
    ));
    assert!(matches!(
        cc.decrypt(&params, &forged, &bob_key),
        Err(Error::VerificationFailed(_))
    ));

    // bob relabelling his own key does not help: the attribute secrets
    // depend on the handle
    let mut stolen = cc.keygen(&msk, &attributes, &bob)?;
    stolen.ptid = alice;
    assert!(matches!(
        cc.decrypt(&params, &ctp, &stolen),
        Err(Error::KeyMismatch(_))
    ));
    stolen.binding = cc.keygen(&msk, &attributes, &alice)?.binding;
    assert!(matches!(
        cc.decrypt(&params, &ctp, &stolen),
        Err(Error::VerificationFailed(_))
    ));
    assert!(cc.verify_user_key(&msk, &stolen).is_err());
    Ok(())
}

#[test]
fn test_idempotence() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let attributes = premium_driver()?;
    let ptid = cc.derive_ptid(&msk, b"driver", b"ride");
    let ct = cc.encrypt(&params, &gen_policy()?, RIDE)?;

    let rk1 = cc.rekey(&msk, &ct, &ptid, &attributes)?;
    let rk2 = cc.rekey(&msk, &ct, &ptid, &attributes)?;
    assert_eq!(rk1.serialize()?, rk2.serialize()?);

    let ctp1 = cc.reencrypt(&ct, &rk1)?;
    let ctp2 = cc.reencrypt(&ct, &rk2)?;
    assert_eq!(ctp1.serialize()?, ctp2.serialize()?);
    assert_eq!(ctp1.digest()?, ctp2.digest()?);
    assert_ne!(ctp1.digest()?, ct.digest()?);

    // extra attributes of the recipient do not change the re-key
    let more = AttributeSet::from_names(["verified", "premium", "licensed", "pets"])?;
    assert_eq!(rk1, cc.rekey(&msk, &ct, &ptid, &more)?);

    // two encryptions of the same plaintext are unlinkable
    let ct_ = cc.encrypt(&params, &gen_policy()?, RIDE)?;
    assert_ne!(ct.digest()?, ct_.digest()?);
    Ok(())
}

/// A CT' holds neither the ephemeral point of the original ciphertext nor
/// its masked shares, and a re-key only applies to its own ciphertext.
#[test]
fn test_unidirectionality() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let attributes = premium_driver()?;
    let ptid = cc.derive_ptid(&msk, b"driver", b"ride");
    let ct = cc.encrypt(&params, &gen_policy()?, RIDE)?;
    let rk = cc.rekey(&msk, &ct, &ptid, &attributes)?;
    let ctp = cc.reencrypt(&ct, &rk)?;

    let ctp_bytes = ctp.serialize()?;
    let ct_point = ct.c.to_bytes();
    assert!(!ctp_bytes.windows(ct_point.len()).any(|w| w == ct_point));
    for share in &ct.shares {
        assert!(!ctp.shares.contains(share));
    }

    let other = cc.encrypt(&params, &gen_policy()?, b"pickup=C,dest=D")?;
    assert!(matches!(
        cc.reencrypt(&other, &rk),
        Err(Error::KeyMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_tampering() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, params) = cc.setup()?;
    let attributes = premium_driver()?;
    let ptid = cc.derive_ptid(&msk, b"driver", b"ride");
    let usk = cc.keygen(&msk, &attributes, &ptid)?;
    let ct = cc.encrypt(&params, &gen_policy()?, RIDE)?;
    let ctp = cc.reencrypt(&ct, &cc.rekey(&msk, &ct, &ptid, &attributes)?)?;

    let mut corrupted = ctp.clone();
    corrupted.body[0] ^= 1;
    assert!(matches!(
        cc.decrypt(&params, &corrupted, &usk),
        Err(Error::VerificationFailed(_))
    ));

    let mut corrupted = ctp.clone();
    corrupted.shares[0][0] ^= 1;
    assert!(cc.verify(&params, &corrupted).is_err());

    // replay against another request
    let other = cc.encrypt(&params, &gen_policy()?, RIDE)?;
    assert!(matches!(
        cc.verify_for(&params, &ctp, &other.digest()?, &ptid),
        Err(Error::KeyMismatch(_))
    ));

    // another deployment does not accept this CT'
    let (_, other_params) = cc.setup()?;
    assert!(cc.verify(&other_params, &ctp).is_err());
    Ok(())
}

#[test]
fn test_empty_inputs() -> Result<(), Error> {
    let cc = RideCrypt::default();
    let (msk, _) = cc.setup()?;
    let ptid = cc.derive_ptid(&msk, b"driver", b"ride");
    assert!(matches!(
        cc.keygen(&msk, &AttributeSet::default(), &ptid),
        Err(Error::InvalidAttributes(_))
    ));
    Ok(())
}

#[test]
fn test_service() -> Result<(), Error> {
    let service = CryptoService::setup(RideCrypt::default())?;
    let policy = gen_policy()?;
    let attributes = premium_driver()?;

    let ptid = match service.call(CryptoRequest::DerivePtid {
        identity: b"driver".to_vec(),
        context: b"ride".to_vec(),
    })? {
        CryptoResponse::Ptid(ptid) => ptid,
        other => return Err(other.unexpected("derive_ptid")),
    };
    let usk = match service.call(CryptoRequest::KeyGen {
        attributes: attributes.clone(),
        ptid,
    })? {
        CryptoResponse::UserKeys(usk) => usk,
        other => return Err(other.unexpected("keygen")),
    };
    let (ct, ct_hash) = match service.call(CryptoRequest::Encrypt {
        plaintext: RIDE.to_vec().into(),
        policy: policy.clone(),
    })? {
        CryptoResponse::Encrypted { ct, ct_hash, binding } => {
            assert_eq!(&binding, ct.binding());
            (ct, ct_hash)
        }
        other => return Err(other.unexpected("encrypt")),
    };
    assert_eq!(ct_hash, ct.digest()?);

    assert!(matches!(
        service.call(CryptoRequest::Match {
            attributes: standard_driver()?,
            policy,
        })?,
        CryptoResponse::Matched(false)
    ));
    assert!(matches!(
        service.call(CryptoRequest::ReKey {
            ct: ct.clone(),
            recipient: ptid,
            attributes: standard_driver()?,
        }),
        Err(Error::PolicyNotSatisfied)
    ));

    let rk = match service.call(CryptoRequest::ReKey {
        ct: ct.clone(),
        recipient: ptid,
        attributes,
    })? {
        CryptoResponse::ReKey(rk) => rk,
        other => return Err(other.unexpected("rekey")),
    };
    let ctp = match service.call(CryptoRequest::ReEncrypt { ct, rk })? {
        CryptoResponse::Reencrypted(ctp) => ctp,
        other => return Err(other.unexpected("reencrypt")),
    };
    assert!(matches!(
        service.call(CryptoRequest::Verify {
            ctp: ctp.clone(),
            expected: Some((ct_hash, ptid)),
        })?,
        CryptoResponse::Verified(true)
    ));
    assert!(matches!(
        service.call(CryptoRequest::Verify {
            ctp: ctp.clone(),
            expected: Some((ctp.digest()?, ptid)),
        })?,
        CryptoResponse::Verified(false)
    ));
    // the recipient decrypts on its side, with public parameters only
    let ptx = RideCrypt::default().decrypt(service.params(), &ctp, &usk)?;
    assert_eq!(&*ptx, RIDE);
    Ok(())
}
