//! Implementations of the JSON Web Algorithms (JWA) standard
//!
//! Only the RSA family is carried here, and of it only the PKCS #1 v1.5
//! SHA-256 variant used for service-account assertions.
//!
//! The specifications for these algorithms can be found in [RFC7518][].
//!
//! [RFC7518]: https://tools.ietf.org/html/rfc7518

pub mod rsa;

#[doc(inline)]
pub use rsa::{PrivateKey, PublicKey};
