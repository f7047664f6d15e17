//! This crate implements the pieces of the Javascript/JSON Object Signing and
//! Encryption (JOSE) standards needed to mint service-account assertions:
//!
//! * JSON Web Signature (JWS): [RFC7515][]
//! * JSON Web Algorithms (JWA): [RFC7518][], RS256 only
//! * JSON Web Token (JWT): [RFC7519][]
//!
//! RSA private keys are read from PEM, in either PKCS #8 or PKCS #1 form, and
//! produce deterministic PKCS #1 v1.5 SHA-256 signatures. The digest may be
//! fed incrementally through [`jwa::rsa::SigningStream`]. The public half of a
//! key can verify what it signed.
//!
//! [RFC7515]: https://tools.ietf.org/html/rfc7515
//! [RFC7518]: https://tools.ietf.org/html/rfc7518
//! [RFC7519]: https://tools.ietf.org/html/rfc7519

#![cfg_attr(docsrs, feature(doc_cfg))]
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

pub mod error;
pub mod jwa;
pub mod jws;
pub mod jwt;

#[doc(inline)]
pub use jwt::{Jwt, JwtRef};
