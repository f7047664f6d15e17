//! Host-facing status reporting
//!
//! Every failure inside the token manager is flattened into a [`TokenError`]
//! carrying a stable numeric code, so that hosts can log or display it
//! without knowing the error types of each component.

use std::{error::Error as StdError, fmt};

use crate::{
    assertion::BuildError, credentials::ParseError, exchange::ExchangeError, tokens::TokenState,
};

/// The kind of token a manager issues
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// No token has been configured
    #[default]
    Undefined,
    /// An OAuth 2.0 bearer access token
    AccessToken,
}

impl TokenKind {
    /// Human-readable name of the token kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::AccessToken => "OAuth2.0 access token",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category of failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The service-account document is not valid JSON
    MalformedCredential,
    /// A required service-account field is absent
    MissingField,
    /// The private key is not a usable RSA key
    InvalidKey,
    /// The token endpoint is not a URL
    InvalidTokenUri,
    /// The service-account document could not be read
    CredentialUnreadable,
    /// The key is too short to sign with
    KeyTooSmall,
    /// Signing failed for another reason
    Signing,
    /// The clock does not hold a real time yet
    ClockNotSet,
    /// The network is down or the endpoint is unreachable
    NetworkUnavailable,
    /// The endpoint did not answer in time
    Timeout,
    /// The endpoint answered with an unusable body
    MalformedResponse,
    /// The token endpoint cannot be reached over HTTPS
    InvalidEndpoint,
    /// The transport failed mid-exchange
    Io,
    /// The endpoint rejected the request
    HttpStatus(u16),
}

impl ErrorKind {
    /// The stable numeric code for this kind
    ///
    /// Rejections by the endpoint report the HTTP status itself. Every
    /// other kind is negative.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::MalformedCredential => -10,
            Self::MissingField => -11,
            Self::InvalidKey => -12,
            Self::InvalidTokenUri => -13,
            Self::CredentialUnreadable => -14,
            Self::KeyTooSmall => -20,
            Self::Signing => -21,
            Self::ClockNotSet => -30,
            Self::NetworkUnavailable => -40,
            Self::Timeout => -41,
            Self::MalformedResponse => -42,
            Self::InvalidEndpoint => -43,
            Self::Io => -44,
            Self::HttpStatus(code) => code as i32,
        }
    }

    /// Whether retrying without reconfiguration cannot help
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::MalformedCredential
                | Self::MissingField
                | Self::InvalidKey
                | Self::InvalidTokenUri
                | Self::CredentialUnreadable
                | Self::KeyTooSmall
                | Self::Signing
                | Self::InvalidEndpoint
        )
    }
}

/// A failure as reported to the host
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenError {
    kind: ErrorKind,
    message: String,
}

impl TokenError {
    /// Constructs an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The failure category
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The stable numeric code
    #[inline]
    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    /// A description of the failure, including its causes
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether retrying without reconfiguration cannot help
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "code: {}, message: {}", self.code(), self.message)
    }
}

/// Joins an error with its chain of sources
fn chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl From<&ParseError> for TokenError {
    fn from(err: &ParseError) -> Self {
        let kind = match err {
            ParseError::Malformed(_) => ErrorKind::MalformedCredential,
            ParseError::MissingField(_) => ErrorKind::MissingField,
            ParseError::InvalidKey(_) => ErrorKind::InvalidKey,
            ParseError::InvalidTokenUri(_) => ErrorKind::InvalidTokenUri,
            ParseError::Unreadable(_) => ErrorKind::CredentialUnreadable,
        };
        Self::new(kind, chain_message(err))
    }
}

impl From<&BuildError> for TokenError {
    fn from(err: &BuildError) -> Self {
        let kind = match err {
            BuildError::ClockNotSet { .. } => ErrorKind::ClockNotSet,
            e if e.is_key_too_small() => ErrorKind::KeyTooSmall,
            _ => ErrorKind::Signing,
        };
        Self::new(kind, chain_message(err))
    }
}

impl From<&ExchangeError> for TokenError {
    fn from(err: &ExchangeError) -> Self {
        let kind = match err {
            ExchangeError::InvalidEndpoint(_) => ErrorKind::InvalidEndpoint,
            ExchangeError::NetworkUnavailable(_) => ErrorKind::NetworkUnavailable,
            ExchangeError::Timeout => ErrorKind::Timeout,
            ExchangeError::HttpStatus { code, .. } => ErrorKind::HttpStatus(*code),
            ExchangeError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ExchangeError::Io(_) => ErrorKind::Io,
        };
        Self::new(kind, chain_message(err))
    }
}

/// A snapshot of a token manager's status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenInfo {
    /// The kind of token being managed
    pub kind: TokenKind,
    /// The lifecycle state
    pub state: TokenState,
    /// The most recent failure, cleared on success
    pub error: Option<TokenError>,
}

impl TokenInfo {
    /// The error rendered as `code: <n>, message: <text>`, or empty
    #[must_use]
    pub fn error_string(&self) -> String {
        self.error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_reports_its_own_code() {
        assert_eq!(ErrorKind::HttpStatus(401).code(), 401);
        assert!(!ErrorKind::HttpStatus(401).is_fatal());
    }

    #[test]
    fn credential_kinds_are_fatal() {
        assert!(ErrorKind::MissingField.is_fatal());
        assert!(ErrorKind::KeyTooSmall.is_fatal());
        assert!(!ErrorKind::ClockNotSet.is_fatal());
        assert!(!ErrorKind::Timeout.is_fatal());
        assert!(!ErrorKind::NetworkUnavailable.is_fatal());
    }

    #[test]
    fn missing_field_message_and_code() {
        let err = TokenError::from(&ParseError::MissingField("private_key"));
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert_eq!(
            err.to_string(),
            "code: -11, message: service account document is missing required field `private_key`"
        );
    }

    #[test]
    fn exchange_errors_include_detail() {
        let err = TokenError::from(&ExchangeError::HttpStatus {
            code: 400,
            error: Some("invalid_grant".into()),
            error_description: Some("Invalid JWT Signature.".into()),
        });
        assert_eq!(err.code(), 400);
        assert!(err.message().contains("invalid_grant"));
        assert!(err.message().contains("Invalid JWT Signature."));
    }

    #[test]
    fn empty_error_string_without_error() {
        let info = TokenInfo::default();
        assert_eq!(info.error_string(), "");
        assert_eq!(info.kind.as_str(), "undefined");
        assert_eq!(TokenKind::AccessToken.to_string(), "OAuth2.0 access token");
    }
}
