//! RSA JSON Web Algorithm implementations

use std::{convert::TryFrom, fmt};

use serde::{Deserialize, Serialize};

use crate::{error, jws};

mod private;
mod public;

pub use private::{PrivateKey, SigningStream};
pub use public::PublicKey;

/// Length of a DER-encoded SHA-256 `DigestInfo` (19 byte prefix + 32 byte digest)
const SHA256_DIGEST_INFO_LEN: usize = 51;

/// Minimum bytes of `0x00 0x01 PS 0x00` framing required by PKCS #1 v1.5
const PKCS1_PADDING_OVERHEAD: usize = 11;

/// Smallest modulus, in bytes, able to carry an RS256 signature
pub const MIN_MODULUS_LEN: usize = SHA256_DIGEST_INFO_LEN + PKCS1_PADDING_OVERHEAD;

/// RSA public/private key signing algorithms
///
/// This list may be expanded in the future.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
#[non_exhaustive]
pub enum SigningAlgorithm {
    /// RSA producing a modulus-sized signature, using SHA-256 and PKCS 1.5
    RS256,
}

impl SigningAlgorithm {
    fn into_verification_params(self) -> &'static ring::signature::RsaParameters {
        match self {
            SigningAlgorithm::RS256 => &ring::signature::RSA_PKCS1_2048_8192_SHA256,
        }
    }
}

impl From<SigningAlgorithm> for jws::Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        Self::Rsa(alg)
    }
}

impl TryFrom<jws::Algorithm> for SigningAlgorithm {
    type Error = error::IncompatibleAlgorithm;

    fn try_from(alg: jws::Algorithm) -> Result<Self, Self::Error> {
        match alg {
            jws::Algorithm::Rsa(alg) => Ok(alg),

            #[allow(unreachable_patterns)]
            _ => Err(error::incompatible_algorithm(alg)),
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::RS256 => "RS256",
        };

        f.write_str(s)
    }
}
