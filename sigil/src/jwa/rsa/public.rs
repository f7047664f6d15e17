use std::convert::TryFrom;

use serde::{Deserialize, Serialize};
use sigil_base64::{Base64Url, Base64UrlRef};

use super::SigningAlgorithm;
use crate::{error, jws};

/// RSA public key components
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PublicKeyDto")]
pub struct PublicKey {
    /// The public modulus
    #[serde(rename = "n")]
    modulus: Base64Url,

    /// The public exponent
    #[serde(rename = "e")]
    exponent: Base64Url,
}

impl PublicKey {
    /// The public key's modulus
    pub fn modulus(&self) -> &Base64UrlRef {
        &self.modulus
    }

    /// The public key's exponent
    pub fn exponent(&self) -> &Base64UrlRef {
        &self.exponent
    }

    /// Constructs a public key from the modulus and exponent
    ///
    /// Size limits are enforced at verification time, which only accepts
    /// moduli of 2048 to 8192 bits.
    ///
    /// # Errors
    ///
    /// The modulus or exponent is empty.
    pub fn from_components(
        modulus: impl Into<Base64Url>,
        exponent: impl Into<Base64Url>,
    ) -> Result<Self, error::KeyRejected> {
        let modulus = modulus.into();
        let exponent = exponent.into();
        if modulus.as_slice().is_empty() {
            return Err(error::key_rejected("key modulus must not be empty"));
        }
        if exponent.as_slice().is_empty() {
            return Err(error::key_rejected("key exponent must not be empty"));
        }

        Ok(Self { modulus, exponent })
    }

    pub(super) fn from_trusted_components(modulus: Base64Url, exponent: Base64Url) -> Self {
        Self { modulus, exponent }
    }
}

impl jws::Verifier for PublicKey {
    type Algorithm = jws::Algorithm;
    type Error = error::JwtVerifyError;

    fn can_verify(&self, alg: Self::Algorithm) -> bool {
        SigningAlgorithm::try_from(alg).is_ok()
    }

    fn verify(
        &self,
        alg: Self::Algorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), Self::Error> {
        let alg = SigningAlgorithm::try_from(alg)?;

        let pk = ring::signature::RsaPublicKeyComponents {
            n: self.modulus.as_slice(),
            e: self.exponent.as_slice(),
        };

        pk.verify(alg.into_verification_params(), data, signature)
            .map_err(|_| error::signature_mismatch().into())
    }
}

impl TryFrom<PublicKeyDto> for PublicKey {
    type Error = error::KeyRejected;

    fn try_from(dto: PublicKeyDto) -> Result<Self, Self::Error> {
        Self::from_components(dto.modulus, dto.exponent)
    }
}

/// RSA public key components
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct PublicKeyDto {
    /// The public modulus
    #[serde(rename = "n")]
    modulus: Base64Url,

    /// The public exponent
    #[serde(rename = "e")]
    exponent: Base64Url,
}
