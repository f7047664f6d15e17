//! Implementations of the JSON Web Tokens (JWT) standard
//!
//! The specifications for this standard can be found in [RFC7519][].
//!
//! Unencrypted JWTs generally appear as a three-part base64-encoded string,
//! where each part is separated by a `.`.
//!
//! ```text
//! eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9.eyJpc3MiOiJzZW5zb3IifQ.<signature>
//! ```
//!
//! The first section is the header in JSON format, naming the signing
//! algorithm. The second section is the payload in JSON format, carrying the
//! claims. The third section is the binary signature computed over the first
//! two sections exactly as they appear, joined by the `.`.
//!
//! [RFC7519]: https://tools.ietf.org/html/rfc7519
//!
//! ```
//! use sigil::{jws, jwt::{BasicHeaders, Jwt}, jwa::PrivateKey};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let pem = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/data/rsa/private-pkcs8.pem"))?;
//! let key = PrivateKey::from_pem(&pem)?;
//!
//! let headers = BasicHeaders::new(jws::Algorithm::RS256).with_type("JWT");
//! let claims = serde_json::json!({ "iss": "sensor-17" });
//!
//! let token = Jwt::try_from_parts_with_signature(&headers, &claims, &key)?;
//! assert!(token.as_str().starts_with("eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9."));
//!
//! let validated: sigil::jwt::Validated<serde_json::Value> =
//!     token.verify_signature(&key.public_key())?;
//! assert_eq!(validated.claims()["iss"], "sensor-17");
//! # Ok(())
//! # }
//! ```

use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use sigil_base64::{Base64Url, Base64UrlRef};

use crate::{error, jws};

/// Indicates that the type has a signing algorithm
pub trait HasAlgorithm {
    /// The signing algorithm
    fn alg(&self) -> jws::Algorithm;
}

/// A token whose signature has been checked
///
/// Only the signature is checked. Claims such as expiry are left to the
/// caller.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Validated<C, H = BasicHeaders> {
    headers: H,
    claims: C,
}

impl<C, H> Validated<C, H> {
    /// Extracts the header and claims from the token
    pub fn extract(self) -> (H, C) {
        (self.headers, self.claims)
    }

    /// The validated token headers
    pub fn headers(&self) -> &H {
        &self.headers
    }

    /// The validated token claims
    pub fn claims(&self) -> &C {
        &self.claims
    }
}

/// A decomposed JWT
///
/// This structure is suitable for inspection to determine which key
/// should be used to validate the JWT.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct Decomposed<'a, H = BasicHeaders> {
    header: H,
    message: &'a str,
    payload: &'a str,
    signature: Base64Url,
}

macro_rules! expect_two {
    ($iter:expr) => {{
        let mut i = $iter;
        match (i.next(), i.next(), i.next()) {
            (Some(first), Some(second), None) => Some((first, second)),
            _ => None,
        }
    }};
}

impl<'a, H> Decomposed<'a, H>
where
    H: HasAlgorithm,
{
    /// Verifies the signature of the decomposed JWT and decodes its claims
    ///
    /// # Errors
    ///
    /// Returns an error if the signature does not verify or the payload
    /// cannot be decoded.
    pub fn verify<C, V>(self, key: &'_ V) -> Result<Validated<C, H>, error::JwtVerifyError>
    where
        C: for<'de> Deserialize<'de>,
        V: jws::Verifier<Algorithm = jws::Algorithm>,
        error::JwtVerifyError: From<V::Error>,
    {
        key.verify(
            self.header.alg(),
            self.message.as_bytes(),
            self.signature.as_slice(),
        )?;

        let p_raw = Base64Url::from_encoded(self.payload).map_err(error::malformed_jwt_payload)?;

        let claims: C =
            serde_json::from_slice(p_raw.as_slice()).map_err(error::malformed_jwt_payload)?;

        Ok(Validated {
            headers: self.header,
            claims,
        })
    }

    /// The untrusted headers of the JWT
    ///
    /// **WARNING:** *These headers have not been validated and should not be trusted.*
    pub fn untrusted_header(&self) -> &H {
        &self.header
    }

    /// The untrusted payload of the JWT, still base64url-encoded
    pub fn untrusted_payload(&self) -> &'a str {
        self.payload
    }

    /// The signing input of the JWT
    ///
    /// This contains the encoded header and payload of the JWT, separated by a `.`.
    pub fn untrusted_message(&self) -> &'a str {
        self.message
    }

    /// The raw signature of the JWT
    pub fn signature(&self) -> &Base64UrlRef {
        &self.signature
    }
}

impl JwtRef {
    /// Decomposes the JWT into its parts, preparing it for later processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the JWT is malformed.
    pub fn decompose<H>(&self) -> Result<Decomposed<H>, error::JwtVerifyError>
    where
        H: for<'de> Deserialize<'de>,
    {
        let (s_str, message) =
            expect_two!(self.as_str().rsplitn(2, '.')).ok_or_else(error::malformed_jwt)?;
        let (payload, h_str) =
            expect_two!(message.rsplitn(2, '.')).ok_or_else(error::malformed_jwt)?;
        let h_raw = Base64Url::from_encoded(h_str).map_err(error::malformed_jwt_header)?;
        let signature = Base64Url::from_encoded(s_str).map_err(error::malformed_jwt_signature)?;
        let header: H =
            serde_json::from_slice(h_raw.as_slice()).map_err(error::malformed_jwt_header)?;
        Ok(Decomposed {
            header,
            message,
            payload,
            signature,
        })
    }

    /// Checks the token's signature against a key and decodes its claims
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed or the signature does not
    /// verify.
    pub fn verify_signature<C, V>(
        &self,
        key: &'_ V,
    ) -> Result<Validated<C, BasicHeaders>, error::JwtVerifyError>
    where
        C: for<'de> Deserialize<'de>,
        V: jws::Verifier<Algorithm = jws::Algorithm>,
        error::JwtVerifyError: From<V::Error>,
    {
        self.decompose::<BasicHeaders>()?.verify(key)
    }
}

/// A JSON Web Token
///
/// This type provides custom implementations of [`Display`][JwtRef#impl-Display] and
/// [`Debug`][JwtRef#impl-Debug] to prevent unintentional disclosures of sensitive values.
/// See the documentation on those trait implementations on the [`JwtRef`] type for more
/// information.
#[braid(
    serde,
    debug = "owned",
    display = "owned",
    ord = "omit",
    ref_doc = "\
    A borrowed reference to a JSON Web Token ([`Jwt`])\n\
    \n\
    This type provides custom implementations of [`Display`][Self#impl-Display] and \
    [`Debug`][Self#impl-Debug] to prevent unintentional disclosures of sensitive values. \
    See the documentation on those trait implementations for more information.
    "
)]
#[must_use]
pub struct Jwt;

impl Jwt {
    /// Constructs a new JWT from a header and payload, signed by the given signer
    ///
    /// Headers and payload are serialized as compact JSON in field declaration
    /// order, so the same inputs always produce the same signing input.
    ///
    /// # Errors
    ///
    /// * If serialization of either the header or payload fails
    /// * If the signer cannot produce a signature with the requested algorithm
    pub fn try_from_parts_with_signature<H, P, S>(
        headers: &H,
        payload: &P,
        signer: &S,
    ) -> Result<Self, error::JwtSigningError>
    where
        H: Serialize + HasAlgorithm,
        P: Serialize,
        S: jws::Signer<Algorithm = jws::Algorithm> + ?Sized,
        error::SigningError: From<S::Error>,
    {
        let h_raw =
            Base64Url::from_raw(serde_json::to_vec(headers).map_err(error::malformed_jwt_header)?);
        let p_raw =
            Base64Url::from_raw(serde_json::to_vec(payload).map_err(error::malformed_jwt_payload)?);

        let mut message = String::with_capacity(h_raw.encoded_len() + p_raw.encoded_len() + 1);
        h_raw.encode_into(&mut message);
        message.push('.');
        p_raw.encode_into(&mut message);

        let signature = signer
            .sign(headers.alg(), message.as_bytes())
            .map_err(error::SigningError::from)?;

        let s_raw = Base64UrlRef::from_slice(&signature);
        message.reserve(s_raw.encoded_len() + 1);
        message.push('.');
        s_raw.encode_into(&mut message);

        Ok(Self::new(message))
    }
}

/// By default, this type holds potentially sensitive information. To prevent
/// unintentional disclosure of this value, this type will not print out its
/// contents without explicitly specifying the alternate debug format,
/// i.e. `{:#?}`. When specified in this form, it will print out the entire header
/// and payload, but will omit the token's signature. To change the number of
/// characters in the signature that should be printed, specify the amount as a
/// width in the format string, i.e. `{:#25?}`.
///
/// If not specified, a placeholder value will be printed out instead to indicate
/// that it is hiding sensitive information.
///
/// # Example
///
/// ```
/// # use sigil::jwt::JwtRef;
/// #
/// let token = JwtRef::from_str("eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
///
/// assert_eq!(format!("{:?}", token), "***JWT***");
/// assert_eq!(format!("{:#?}", token), "\"eyJhbGciOiJSUzI1NiJ9.e30.…\"");
/// assert_eq!(format!("{:#5?}", token), "\"eyJhbGciOiJSUzI1NiJ9.e30.c2lu…\"");
/// ```
impl fmt::Debug for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            f.write_str("\"")?;
            if let Some(last_period) = self.0.rfind('.') {
                f.write_str(&self.0[..=last_period])?;
                limited_reveal(&self.0[last_period + 1..], &mut *f, 0)?;
            } else {
                limited_reveal(&self.0, &mut *f, 0)?;
            }
            f.write_str("\"")
        } else {
            f.write_str(concat!("***", "JWT", "***"))
        }
    }
}

/// By default, this type holds potentially sensitive information. To prevent
/// unintentional disclosure of this value, this type will not print out its
/// contents without explicitly specifying the alternate format,
/// i.e. `{:#}`. When specified in this form, it will print out the entire token by default.
/// A width, i.e. `{:#10}`, limits how much of the signature is shown.
///
/// # Example
///
/// ```
/// # use sigil::jwt::JwtRef;
/// #
/// let token = JwtRef::from_str("eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
///
/// assert_eq!(format!("{}", token), "***JWT***");
/// assert_eq!(format!("{:#}", token), "eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl");
/// assert_eq!(format!("{:#5}", token), "eyJhbGciOiJSUzI1NiJ9.e30.c2lu…");
/// ```
impl fmt::Display for JwtRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if f.alternate() {
            if let Some(last_period) = self.0.rfind('.') {
                f.write_str(&self.0[..=last_period])?;
                limited_reveal(&self.0[last_period + 1..], &mut *f, usize::MAX)
            } else {
                limited_reveal(&self.0, &mut *f, usize::MAX)
            }
        } else {
            f.write_str(concat!("***", "JWT", "***"))
        }
    }
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// Minimal set of headers for signed JWTs
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct BasicHeaders {
    alg: jws::Algorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

impl BasicHeaders {
    /// Constructs JWT headers, to be signed by the specified algorithm
    pub const fn new(alg: jws::Algorithm) -> Self {
        Self { alg, typ: None }
    }

    /// Sets the media type of the token, such as `JWT`
    pub fn with_type(mut self, typ: impl Into<String>) -> Self {
        self.typ = Some(typ.into());
        self
    }

    /// The media type of the token, if declared
    #[must_use]
    pub fn typ(&self) -> Option<&str> {
        self.typ.as_deref()
    }
}

impl HasAlgorithm for BasicHeaders {
    fn alg(&self) -> jws::Algorithm {
        self.alg
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    #[cfg(feature = "tracing")]
    use tracing_test::traced_test;

    use super::*;
    use crate::{jwa::PrivateKey, test::rsa::*};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Claims {
        iss: String,
        iat: u64,
    }

    #[test]
    fn header_serializes_compactly_in_order() -> Result<()> {
        let headers = BasicHeaders::new(jws::Algorithm::RS256).with_type("JWT");
        assert_eq!(
            serde_json::to_string(&headers)?,
            r#"{"alg":"RS256","typ":"JWT"}"#
        );
        Ok(())
    }

    #[test]
    #[cfg_attr(feature = "tracing", traced_test)]
    fn round_trip_rs256() -> Result<()> {
        let key = PrivateKey::from_pem(PRIVATE_KEY_PKCS8)?;
        let headers = BasicHeaders::new(jws::Algorithm::RS256).with_type("JWT");
        let claims = Claims {
            iss: "sensor-17".into(),
            iat: 1_700_000_000,
        };

        let token = Jwt::try_from_parts_with_signature(&headers, &claims, &key)?;
        assert_eq!(token.as_str().matches('.').count(), 2);

        let validated: Validated<Claims> = token.verify_signature(&key.public_key())?;
        let (h, c) = validated.extract();
        assert_eq!(h, headers);
        assert_eq!(c, claims);
        Ok(())
    }

    #[test]
    fn tampered_payload_fails_verification() -> Result<()> {
        let key = PrivateKey::from_pem(PRIVATE_KEY_PKCS8)?;
        let headers = BasicHeaders::new(jws::Algorithm::RS256);
        let claims = Claims {
            iss: "sensor-17".into(),
            iat: 1,
        };

        let token = Jwt::try_from_parts_with_signature(&headers, &claims, &key)?;
        let decomposed = token.decompose::<BasicHeaders>()?;

        let forged_payload = sigil_base64::encode(br#"{"iss":"sensor-18","iat":1}"#);
        let forged = format!(
            "{}.{}.{}",
            decomposed.untrusted_message().split('.').next().unwrap_or_default(),
            forged_payload,
            decomposed.signature(),
        );

        let err = JwtRef::from_str(&forged)
            .verify_signature::<Claims, _>(&key.public_key())
            .unwrap_err();
        assert!(err.is_signature_mismatch());
        Ok(())
    }

    #[test]
    fn two_segments_is_malformed() {
        let err = JwtRef::from_str("eyJhbGciOiJSUzI1NiJ9.e30")
            .decompose::<BasicHeaders>()
            .unwrap_err();
        assert!(matches!(err, error::JwtVerifyError::MalformedToken(_)));
    }

    #[test]
    fn undersized_key_surfaces_as_signing_error() -> Result<()> {
        let key = PrivateKey::from_pem(PRIVATE_KEY_480)?;
        let headers = BasicHeaders::new(jws::Algorithm::RS256);

        let err = Jwt::try_from_parts_with_signature(&headers, &serde_json::json!({}), &key)
            .unwrap_err();
        assert!(matches!(
            err,
            error::JwtSigningError::SigningError(ref e) if e.is_key_too_small()
        ));
        Ok(())
    }
}
