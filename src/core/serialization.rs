//! Implements the serialization methods of the engine objects.
//!
//! Digests of ciphertexts are computed over these encodings, so the layout of
//! each object is fixed: fields are written in declaration order, points and
//! scalars as 32-byte arrays, variable-length parts LEB128-prefixed.

use cosmian_crypto_core::{
    bytes_ser_de::{to_leb128_len, Deserializer, Serializable, Serializer},
    FixedSizeCBytes, R25519PrivateKey, R25519PublicKey, SymmetricKey,
};

use super::{
    Ciphertext, Digest, MasterSecretKey, PartyHandle, ReKey, ReencryptedCiphertext, Share,
    Signature, SystemParameters, UserSecretKey, DIGEST_LENGTH, KMAC_KEY_LENGTH, KMAC_LENGTH,
    NONCE_LENGTH, SEED_LENGTH,
};
use crate::{
    abe_policy::{AccessPolicy, AttributeToken, ATTRIBUTE_TOKEN_LENGTH},
    Error,
};

fn read_point(de: &mut Deserializer) -> Result<R25519PublicKey, Error> {
    Ok(R25519PublicKey::try_from_bytes(
        de.read_array::<{ R25519PublicKey::LENGTH }>()?,
    )?)
}

fn read_scalar(de: &mut Deserializer) -> Result<R25519PrivateKey, Error> {
    Ok(R25519PrivateKey::try_from_bytes(
        de.read_array::<{ R25519PrivateKey::LENGTH }>()?,
    )?)
}

/// Shares are written without count: it is given by the policy.
fn write_shares(ser: &mut Serializer, shares: &[Share]) -> Result<usize, Error> {
    let mut n = 0;
    for share in shares {
        n += ser.write_array(share)?;
    }
    Ok(n)
}

fn read_shares(de: &mut Deserializer, count: usize) -> Result<Vec<Share>, Error> {
    (0..count)
        .map(|_| de.read_array::<SEED_LENGTH>().map_err(Error::from))
        .collect()
}

impl Serializable for AccessPolicy {
    type Error = Error;

    fn length(&self) -> usize {
        to_leb128_len(self.len()) + self.len() * ATTRIBUTE_TOKEN_LENGTH
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_leb128_u64(self.len() as u64)?;
        for token in self.rows() {
            n += ser.write_array(token.as_ref())?;
        }
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let length = <usize>::try_from(de.read_leb128_u64()?)?;
        let rho = (0..length)
            .map(|_| {
                de.read_array::<ATTRIBUTE_TOKEN_LENGTH>()
                    .map(AttributeToken::from_bytes)
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_rows(rho)
    }
}

impl Serializable for SystemParameters {
    type Error = Error;

    fn length(&self) -> usize {
        2 * R25519PublicKey::LENGTH
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(&self.h.to_bytes())?;
        n += ser.write_array(&self.vk.to_bytes())?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let h = read_point(de)?;
        let vk = read_point(de)?;
        Ok(Self { h, vk })
    }
}

impl Serializable for MasterSecretKey {
    type Error = Error;

    fn length(&self) -> usize {
        2 * R25519PrivateKey::LENGTH + KMAC_KEY_LENGTH
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(&self.s.to_bytes())?;
        n += ser.write_array(&self.v.to_bytes())?;
        n += ser.write_array(&self.kmac_key)?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let s = read_scalar(de)?;
        let v = read_scalar(de)?;
        let kmac_key = SymmetricKey::try_from_bytes(de.read_array::<KMAC_KEY_LENGTH>()?)?;
        Ok(Self { s, v, kmac_key })
    }
}

impl Serializable for UserSecretKey {
    type Error = Error;

    fn length(&self) -> usize {
        3 * KMAC_LENGTH
            + to_leb128_len(self.secrets.len())
            + self.secrets.len() * (ATTRIBUTE_TOKEN_LENGTH + R25519PrivateKey::LENGTH)
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(self.ptid.as_ref())?;
        n += ser.write_array(&self.binding)?;
        n += ser.write_leb128_u64(self.secrets.len() as u64)?;
        for (token, y) in &self.secrets {
            n += ser.write_array(token.as_ref())?;
            n += ser.write_array(&y.to_bytes())?;
        }
        n += ser.write_array(&self.tag)?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let ptid = PartyHandle(de.read_array::<KMAC_LENGTH>()?);
        let binding = de.read_array::<KMAC_LENGTH>()?;
        let length = <usize>::try_from(de.read_leb128_u64()?)?;
        let secrets = (0..length)
            .map(|_| {
                let token = AttributeToken::from_bytes(de.read_array::<ATTRIBUTE_TOKEN_LENGTH>()?);
                Ok::<_, Error>((token, read_scalar(de)?))
            })
            .collect::<Result<_, _>>()?;
        let tag = de.read_array::<KMAC_LENGTH>()?;
        Ok(Self {
            ptid,
            binding,
            secrets,
            tag,
        })
    }
}

impl Serializable for Signature {
    type Error = Error;

    fn length(&self) -> usize {
        R25519PublicKey::LENGTH + R25519PrivateKey::LENGTH
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(&self.r.to_bytes())?;
        n += ser.write_array(&self.z.to_bytes())?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let r = read_point(de)?;
        let z = read_scalar(de)?;
        Ok(Self { r, z })
    }
}

impl Serializable for Ciphertext {
    type Error = Error;

    fn length(&self) -> usize {
        self.policy.length()
            + R25519PublicKey::LENGTH
            + self.shares.len() * SEED_LENGTH
            + NONCE_LENGTH
            + to_leb128_len(self.body.len())
            + self.body.len()
            + KMAC_LENGTH
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = self.policy.write(ser)?;
        n += ser.write_array(&self.c.to_bytes())?;
        n += write_shares(ser, &self.shares)?;
        n += ser.write_array(&self.nonce)?;
        n += ser.write_vec(&self.body)?;
        n += ser.write_array(&self.binding)?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let policy = AccessPolicy::read(de)?;
        let c = read_point(de)?;
        let shares = read_shares(de, policy.len())?;
        let nonce = de.read_array::<NONCE_LENGTH>()?;
        let body = de.read_vec()?;
        let binding = de.read_array::<KMAC_LENGTH>()?;
        Ok(Self {
            policy,
            c,
            shares,
            nonce,
            body,
            binding,
        })
    }
}

impl Serializable for ReKey {
    type Error = Error;

    fn length(&self) -> usize {
        DIGEST_LENGTH
            + KMAC_LENGTH
            + R25519PublicKey::LENGTH
            + to_leb128_len(self.deltas.len())
            + self.deltas.len() * SEED_LENGTH
            + self.signature.length()
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(self.source.as_ref())?;
        n += ser.write_array(self.recipient.as_ref())?;
        n += ser.write_array(&self.rprime.to_bytes())?;
        n += ser.write_leb128_u64(self.deltas.len() as u64)?;
        n += write_shares(ser, &self.deltas)?;
        n += self.signature.write(ser)?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let source = Digest(de.read_array::<DIGEST_LENGTH>()?);
        let recipient = PartyHandle(de.read_array::<KMAC_LENGTH>()?);
        let rprime = read_point(de)?;
        let length = <usize>::try_from(de.read_leb128_u64()?)?;
        let deltas = read_shares(de, length)?;
        let signature = Signature::read(de)?;
        Ok(Self {
            source,
            recipient,
            rprime,
            deltas,
            signature,
        })
    }
}

impl Serializable for ReencryptedCiphertext {
    type Error = Error;

    fn length(&self) -> usize {
        DIGEST_LENGTH
            + KMAC_LENGTH
            + self.policy.length()
            + R25519PublicKey::LENGTH
            + self.shares.len() * SEED_LENGTH
            + NONCE_LENGTH
            + to_leb128_len(self.body.len())
            + self.body.len()
            + KMAC_LENGTH
            + self.signature.length()
    }

    fn write(&self, ser: &mut Serializer) -> Result<usize, Self::Error> {
        let mut n = ser.write_array(self.source.as_ref())?;
        n += ser.write_array(self.recipient.as_ref())?;
        n += self.policy.write(ser)?;
        n += ser.write_array(&self.rprime.to_bytes())?;
        n += write_shares(ser, &self.shares)?;
        n += ser.write_array(&self.nonce)?;
        n += ser.write_vec(&self.body)?;
        n += ser.write_array(&self.binding)?;
        n += self.signature.write(ser)?;
        Ok(n)
    }

    fn read(de: &mut Deserializer) -> Result<Self, Self::Error> {
        let source = Digest(de.read_array::<DIGEST_LENGTH>()?);
        let recipient = PartyHandle(de.read_array::<KMAC_LENGTH>()?);
        let policy = AccessPolicy::read(de)?;
        let rprime = read_point(de)?;
        let shares = read_shares(de, policy.len())?;
        let nonce = de.read_array::<NONCE_LENGTH>()?;
        let body = de.read_vec()?;
        let binding = de.read_array::<KMAC_LENGTH>()?;
        let signature = Signature::read(de)?;
        Ok(Self {
            source,
            recipient,
            policy,
            rprime,
            shares,
            nonce,
            body,
            binding,
            signature,
        })
    }
}

impl Ciphertext {
    /// Digest of the serialized ciphertext, used as its identifier.
    pub fn digest(&self) -> Result<Digest, Error> {
        Ok(Digest::of(&self.serialize()?))
    }
}

impl ReencryptedCiphertext {
    /// Digest of the serialized re-encrypted ciphertext.
    pub fn digest(&self) -> Result<Digest, Error> {
        Ok(Digest::of(&self.serialize()?))
    }
}

#[cfg(test)]
mod tests {
    use cosmian_crypto_core::{reexport::rand_core::SeedableRng, CsRng};

    use super::*;
    use crate::{
        abe_policy::{gen_policy, premium_driver},
        core::primitives::{derive_ptid, encrypt, keygen, reencrypt, rekey, setup},
    };

    #[test]
    fn test_serialization() -> Result<(), Error> {
        let mut rng = CsRng::from_entropy();
        let (msk, params) = setup(&mut rng);
        let ptid = derive_ptid(&msk, b"driver", b"ride");
        let attributes = premium_driver()?;

        let bytes = msk.serialize()?;
        assert_eq!(bytes.len(), msk.length());
        assert_eq!(msk, MasterSecretKey::deserialize(&bytes)?);

        let bytes = params.serialize()?;
        assert_eq!(params, SystemParameters::deserialize(&bytes)?);

        let usk = keygen(&msk, &attributes, &ptid)?;
        let bytes = usk.serialize()?;
        assert_eq!(bytes.len(), usk.length());
        assert_eq!(usk, UserSecretKey::deserialize(&bytes)?);

        let ct = encrypt(&mut rng, &params, &gen_policy()?, b"pickup=A,dest=B")?;
        let bytes = ct.serialize()?;
        assert_eq!(bytes.len(), ct.length());
        let ct_ = Ciphertext::deserialize(&bytes)?;
        assert_eq!(ct, ct_);
        assert_eq!(ct.digest()?, ct_.digest()?);

        let rk = rekey(&msk, &ct, &ptid, &attributes)?;
        let bytes = rk.serialize()?;
        assert_eq!(bytes.len(), rk.length());
        assert_eq!(rk, ReKey::deserialize(&bytes)?);

        let ctp = reencrypt(&ct, &rk)?;
        let bytes = ctp.serialize()?;
        assert_eq!(bytes.len(), ctp.length());
        assert_eq!(ctp, ReencryptedCiphertext::deserialize(&bytes)?);
        Ok(())
    }

    #[test]
    fn test_truncated_input() -> Result<(), Error> {
        let mut rng = CsRng::from_entropy();
        let (_, params) = setup(&mut rng);
        let ct = encrypt(&mut rng, &params, &gen_policy()?, b"pickup=A,dest=B")?;
        let bytes = ct.serialize()?;
        assert!(Ciphertext::deserialize(&bytes[..bytes.len() - 1]).is_err());
        assert!(AccessPolicy::deserialize(&[]).is_err());
        // a policy without rows is rejected on read
        assert!(matches!(
            AccessPolicy::deserialize(&[0]),
            Err(Error::InvalidPolicy(_))
        ));
        Ok(())
    }
}
