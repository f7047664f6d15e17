//! Base64url buffers for the segments of a JSON Web Token
//!
//! Every segment of a JWT (header, claims, and signature) is carried as
//! URL-safe base64 with no padding. This crate wraps byte buffers so that
//! they are held in raw form and only pay the cost of encoding when they
//! are displayed or serialized.
//!
//! Encoding never emits padding. Decoding accepts input with or without
//! trailing `=` characters, inferring the missing padding from the input
//! length, and rejects any character outside the URL-safe alphabet.
//!
//! ```
//! use sigil_base64::Base64Url;
//!
//! let data = Base64Url::from_raw(&b"{\"alg\":\"RS256\",\"typ\":\"JWT\"}"[..]);
//! assert_eq!(data.to_string(), "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9");
//!
//! let back = Base64Url::from_encoded("eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9").unwrap();
//! assert_eq!(back, data);
//! ```
//!
//! The free functions [`encode()`] and [`decode()`] are provided for callers
//! that only need a string or a vector.
//!
//! # Unsafe code
//!
//! [`Base64UrlRef`] is a transparent wrapper around `[u8]`, and reinterpreting
//! a borrowed slice as that type requires two lines of unsafe code. They are
//! confined to [`Base64UrlRef::from_slice()`] and
//! [`Base64UrlRef::from_mut_slice()`].

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{borrow::Borrow, error::Error, fmt, ops};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};

/// URL-safe alphabet, never pads on encode, accepts either form on decode
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// An error while decoding a value which is not properly formatted
/// base64url data
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidBase64Data {
    source: base64::DecodeError,
}

impl From<base64::DecodeError> for InvalidBase64Data {
    fn from(err: base64::DecodeError) -> Self {
        Self { source: err }
    }
}

impl fmt::Display for InvalidBase64Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid base64url data")
    }
}

impl Error for InvalidBase64Data {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

/// Encodes `raw` as unpadded base64url
///
/// Empty input produces an empty string.
#[must_use]
pub fn encode<T: AsRef<[u8]>>(raw: T) -> String {
    URL_SAFE_LENIENT.encode(raw)
}

/// Decodes base64url text, with or without padding
///
/// # Errors
///
/// Returns an error if the input contains characters outside of the
/// URL-safe alphabet or has an impossible length.
pub fn decode<T: AsRef<[u8]>>(enc: T) -> Result<Vec<u8>, InvalidBase64Data> {
    Ok(URL_SAFE_LENIENT.decode(enc)?)
}

/// Owned data to be encoded as URL-safe base64 (no padding)
///
/// Encoding alphabet: `A`–`Z`, `a`–`z`, `0`–`9`, `-`, `_`
///
/// Data is held in memory in its raw form. Costs of serialization
/// are only incurred when serializing or displaying the value in
/// its base64url representation.
#[derive(Clone, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
#[must_use]
pub struct Base64Url(Vec<u8>);

impl Base64Url {
    /// Creates an empty buffer
    #[inline]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Creates a new buffer from an owned value
    ///
    /// To decode a base64url-encoded buffer, use [`from_encoded()`][Self::from_encoded()].
    #[inline]
    pub fn from_raw<T: Into<Vec<u8>>>(raw: T) -> Self {
        Self(raw.into())
    }

    /// Constructs a new buffer from a base64url-encoded slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not valid base64url.
    pub fn from_encoded<T: AsRef<[u8]>>(enc: T) -> Result<Self, InvalidBase64Data> {
        decode(enc).map(Self)
    }

    /// Unwraps the underlying buffer
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    /// Calculates the length of the unpadded encoding of a buffer of size `len`
    #[inline]
    #[must_use]
    pub const fn calc_encoded_len(len: usize) -> usize {
        let d = len / 3 * 4;
        match len % 3 {
            0 => d,
            m => d + m + 1,
        }
    }
}

impl From<Vec<u8>> for Base64Url {
    #[inline]
    fn from(buf: Vec<u8>) -> Self {
        Self(buf)
    }
}

impl From<&'_ [u8]> for Base64Url {
    #[inline]
    fn from(slice: &[u8]) -> Self {
        Self::from_raw(slice)
    }
}

impl From<&'_ Base64UrlRef> for Base64Url {
    #[inline]
    fn from(val: &Base64UrlRef) -> Self {
        Self::from(val.as_slice())
    }
}

impl From<Base64Url> for Vec<u8> {
    #[inline]
    fn from(val: Base64Url) -> Self {
        val.0
    }
}

impl Borrow<Base64UrlRef> for Base64Url {
    #[inline]
    fn borrow(&self) -> &Base64UrlRef {
        self
    }
}

impl ops::Deref for Base64Url {
    type Target = Base64UrlRef;

    #[inline]
    fn deref(&self) -> &Self::Target {
        Base64UrlRef::from_slice(self.0.as_slice())
    }
}

impl ops::DerefMut for Base64Url {
    #[inline]
    fn deref_mut(&mut self) -> &mut Base64UrlRef {
        Base64UrlRef::from_mut_slice(self.0.as_mut_slice())
    }
}

impl AsRef<Base64UrlRef> for Base64Url {
    #[inline]
    fn as_ref(&self) -> &Base64UrlRef {
        self
    }
}

impl fmt::Display for Base64Url {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl fmt::Debug for Base64Url {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Borrowed data to be encoded as URL-safe base64 (no padding)
///
/// Data is borrowed in its raw form. Costs of converting to base64url
/// form are only incurred when serializing or displaying the value.
#[derive(Hash, PartialEq, Eq)]
#[repr(transparent)]
pub struct Base64UrlRef([u8]);

impl Base64UrlRef {
    /// Transparently reinterprets the slice as base64url
    #[allow(unsafe_code)]
    #[inline]
    #[must_use]
    pub fn from_slice(raw: &[u8]) -> &Self {
        let ptr: *const [u8] = raw;

        // `Base64UrlRef` is `repr(transparent)` over `[u8]`
        unsafe { &*(ptr as *const Self) }
    }

    /// Transparently reinterprets the mutable slice as base64url
    #[allow(unsafe_code)]
    #[inline]
    #[must_use]
    pub fn from_mut_slice(raw: &mut [u8]) -> &mut Self {
        let ptr: *mut [u8] = raw;

        // `Base64UrlRef` is `repr(transparent)` over `[u8]`
        unsafe { &mut *(ptr as *mut Self) }
    }

    /// Calculates the length of the unpadded encoding of this buffer
    #[inline]
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        Base64Url::calc_encoded_len(self.0.len())
    }

    /// Provides access to the underlying slice
    #[inline]
    #[must_use]
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Provides mutable access to the underlying slice
    #[inline]
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Appends the encoded form of this buffer to `out`
    ///
    /// Used when assembling a token segment by segment without
    /// intermediate allocations.
    pub fn encode_into(&self, out: &mut String) {
        URL_SAFE_LENIENT.encode_string(&self.0, out);
    }
}

impl ToOwned for Base64UrlRef {
    type Owned = Base64Url;

    #[inline]
    fn to_owned(&self) -> Self::Owned {
        Base64Url(self.0.to_owned())
    }
}

impl PartialEq<Base64UrlRef> for Base64Url {
    #[inline]
    fn eq(&self, other: &Base64UrlRef) -> bool {
        self.0 == other.0
    }
}

impl PartialEq<Base64Url> for Base64UrlRef {
    #[inline]
    fn eq(&self, other: &Base64Url) -> bool {
        self.0 == *other.0.as_slice()
    }
}

impl fmt::Display for Base64UrlRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&encode(&self.0))
    }
}

impl fmt::Debug for Base64UrlRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "`{}`", encode(&self.0))
    }
}

#[cfg(feature = "serde")]
mod serde_impls {
    use super::{decode, encode, Base64Url, Base64UrlRef};

    /// Serialize the underlying byte array as a base64url string
    impl serde::Serialize for Base64UrlRef {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&encode(&self.0))
        }
    }

    /// Serialize the underlying byte array as a base64url string
    impl serde::Serialize for Base64Url {
        #[inline]
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            (**self).serialize(serializer)
        }
    }

    /// Deserialize a base64url string and decode it into a byte array
    impl<'de> serde::Deserialize<'de> for Base64Url {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let raw = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
            let data = decode(raw.as_bytes()).map_err(serde::de::Error::custom)?;
            Ok(Self(data))
        }
    }
}
