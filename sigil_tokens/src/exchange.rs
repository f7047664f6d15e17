//! Trading assertions for access tokens
//!
//! The token endpoint accepts a JWT-bearer assertion as a form-encoded POST
//! and answers with a JSON body naming the access token and its lifetime.

use std::io;

use sigil::JwtRef;
use sigil_clock::DurationSecs;
use thiserror::Error;

use crate::{transport::TrustAnchor, AccessToken, TokenUriRef};

pub mod dto;
mod http;

pub use http::{ExchangeConfig, HttpTokenExchange};

/// The grant type for trading a signed assertion
pub const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// An access token as granted by the token endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangedToken {
    /// The access token
    pub access_token: AccessToken,
    /// The token type, `Bearer` unless the endpoint says otherwise
    pub token_type: String,
    /// How long the token is valid, if the endpoint said
    pub expires_in: Option<DurationSecs>,
}

/// An error while exchanging an assertion
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The token endpoint cannot be reached over HTTPS
    #[error("token endpoint is not usable: {0}")]
    InvalidEndpoint(String),

    /// No connection could be made
    #[error("network unavailable")]
    NetworkUnavailable(#[source] Option<io::Error>),

    /// The endpoint did not answer in time
    #[error("timed out waiting for token response")]
    Timeout,

    /// The endpoint rejected the request
    #[error(
        "token endpoint returned HTTP {code}{}{}",
        error.as_deref().map(|e| format!(" ({})", e)).unwrap_or_default(),
        error_description.as_deref().map(|d| format!(": {}", d)).unwrap_or_default(),
    )]
    HttpStatus {
        /// The HTTP status code
        code: u16,
        /// The OAuth error code, if the body carried one
        error: Option<String>,
        /// The human-readable error description, if the body carried one
        error_description: Option<String>,
    },

    /// The response could not be understood
    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    /// The connection failed mid-exchange
    #[error("error communicating with token endpoint")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedResponse(detail.into())
    }
}

/// Something that can trade an assertion for an access token
pub trait TokenExchange {
    /// Exchanges a signed assertion at the given endpoint
    ///
    /// # Errors
    ///
    /// Any [`ExchangeError`].
    fn exchange(
        &mut self,
        token_uri: &TokenUriRef,
        assertion: &JwtRef,
    ) -> Result<ExchangedToken, ExchangeError>;

    /// Sets how the endpoint's certificate is checked
    ///
    /// # Errors
    ///
    /// Returns an error if the trust anchor cannot be applied.
    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        let _ = trust;
        Ok(())
    }
}

impl<E: TokenExchange + ?Sized> TokenExchange for &'_ mut E {
    fn exchange(
        &mut self,
        token_uri: &TokenUriRef,
        assertion: &JwtRef,
    ) -> Result<ExchangedToken, ExchangeError> {
        (**self).exchange(token_uri, assertion)
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        (**self).set_trust(trust)
    }
}

impl<E: TokenExchange + ?Sized> TokenExchange for Box<E> {
    fn exchange(
        &mut self,
        token_uri: &TokenUriRef,
        assertion: &JwtRef,
    ) -> Result<ExchangedToken, ExchangeError> {
        (**self).exchange(token_uri, assertion)
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        (**self).set_trust(trust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_message_includes_detail() {
        let err = ExchangeError::HttpStatus {
            code: 400,
            error: Some("invalid_grant".into()),
            error_description: Some("Invalid JWT Signature.".into()),
        };
        assert_eq!(
            err.to_string(),
            "token endpoint returned HTTP 400 (invalid_grant): Invalid JWT Signature."
        );

        let bare = ExchangeError::HttpStatus {
            code: 503,
            error: None,
            error_description: None,
        };
        assert_eq!(bare.to_string(), "token endpoint returned HTTP 503");
    }
}
