//! Defines useful macros.

pub use tiny_keccak::{Hasher, IntoXof, Kmac, KmacXof, Sha3, Xof};

/// SHA3-256 digest of the concatenation of the given bytes.
///
/// - `bytes`   : bytes to hash
#[macro_export]
macro_rules! sha3_256 {
    ($($bytes: expr),+) => {
        {
            let mut hasher = $crate::core::macros::Sha3::v256();
            $(
                <$crate::core::macros::Sha3 as $crate::core::macros::Hasher>::update(&mut hasher, $bytes);
            )*
            let mut res = [0; 32];
            <$crate::core::macros::Sha3 as $crate::core::macros::Hasher>::finalize(hasher, &mut res);
            res
        }
    };
}

/// KMAC hash algorithm used to derive keys.
///
/// - `length`  : length of the generated output
/// - `key`     : KMAC key
/// - `bytes`   : bytes to hash
#[macro_export]
macro_rules! kmac {
    ($length: expr, $key: expr, $($bytes: expr),+) => {
        {
            let mut kmac = $crate::core::macros::Kmac::v256($key, b"");
            $(
                <$crate::core::macros::Kmac as $crate::core::macros::Hasher>::update(&mut kmac, $bytes);
            )*
            let mut xof = <$crate::core::macros::Kmac as $crate::core::macros::IntoXof>::into_xof(kmac);
            let mut res = [0; $length];
            <$crate::core::macros::KmacXof as $crate::core::macros::Xof>::squeeze(&mut xof, &mut res);
            res
        }
    };
}
