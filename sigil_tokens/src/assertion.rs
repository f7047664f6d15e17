//! JWT-bearer assertions
//!
//! An assertion is a short-lived JWT, signed with the service account's key,
//! that the token endpoint trades for an access token. Its claims are
//! serialized in a fixed order so that a given credential and time always
//! produce the same bytes.

use serde::Serialize;
use sigil::{
    error::{JwtSigningError, SigningError},
    jws,
    jwt::BasicHeaders,
    Jwt,
};
use sigil_clock::{DurationSecs, UnixTime};
use thiserror::Error;

use crate::{
    config::{normalize_scopes, DEFAULT_SCOPE},
    credentials::Credential,
    tokens::{TokenLifetimeConfig, MAX_ASSERTION_LIFETIME},
    ClientEmailRef, TokenUriRef,
};

/// The claims of a JWT-bearer assertion, in serialization order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AssertionClaims<'a> {
    /// The service account's email address
    pub iss: &'a ClientEmailRef,
    /// Space-separated scopes being requested
    pub scope: &'a str,
    /// The token endpoint
    pub aud: &'a TokenUriRef,
    /// When the assertion was signed
    pub iat: UnixTime,
    /// When the assertion stops being acceptable
    pub exp: UnixTime,
}

/// An error while building an assertion
#[derive(Debug, Error)]
pub enum BuildError {
    /// The clock does not yet hold a real time
    #[error("clock not set: {} is earlier than {}", now.0, floor.0)]
    ClockNotSet {
        /// The time that was supplied
        now: UnixTime,
        /// The earliest time accepted
        floor: UnixTime,
    },

    /// The assertion could not be signed
    #[error("unable to sign assertion")]
    Signing(#[source] SigningError),

    /// The header or claims could not be serialized
    #[error("unable to serialize assertion")]
    Serialize(#[source] JwtSigningError),
}

impl BuildError {
    /// Whether the failure is due to the key being too short to sign with
    #[must_use]
    pub fn is_key_too_small(&self) -> bool {
        matches!(self, Self::Signing(e) if e.is_key_too_small())
    }
}

impl From<JwtSigningError> for BuildError {
    fn from(err: JwtSigningError) -> Self {
        match err {
            JwtSigningError::SigningError(e) => Self::Signing(e),
            other => Self::Serialize(other),
        }
    }
}

/// Builds signed assertions for a credential
#[derive(Clone, Debug)]
pub struct AssertionBuilder {
    lifetime: DurationSecs,
    clock_floor: UnixTime,
    scope: Option<String>,
}

impl Default for AssertionBuilder {
    /// An hour-long assertion, accepting times from 1000 onward, with no scope override
    fn default() -> Self {
        Self::from_lifetime_config(&TokenLifetimeConfig::default())
    }
}

impl AssertionBuilder {
    /// Takes the assertion lifetime and clock floor from a lifetime configuration
    pub fn from_lifetime_config(config: &TokenLifetimeConfig) -> Self {
        Self {
            lifetime: config.assertion_lifetime(),
            clock_floor: config.clock_floor(),
            scope: None,
        }
    }

    /// Requests these scopes in preference to any the credential names
    ///
    /// An empty list clears the override.
    pub fn with_scope(mut self, scope: Option<&str>) -> Self {
        self.scope = scope.map(normalize_scopes).filter(|s| !s.is_empty());
        self
    }

    /// Sets how long assertions remain acceptable, capped at one hour
    pub fn with_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.lifetime = lifetime.min(MAX_ASSERTION_LIFETIME);
        self
    }

    /// The scope that will be requested for the given credential
    ///
    /// An explicitly configured scope wins, then one named in the
    /// credential, then [`DEFAULT_SCOPE`].
    pub fn scope_for<'a>(&'a self, credential: &'a Credential) -> &'a str {
        self.scope
            .as_deref()
            .or_else(|| credential.scope())
            .unwrap_or(DEFAULT_SCOPE)
    }

    /// The claims an assertion signed at `now` would carry
    pub fn claims<'a>(&'a self, credential: &'a Credential, now: UnixTime) -> AssertionClaims<'a> {
        AssertionClaims {
            iss: credential.client_email(),
            scope: self.scope_for(credential),
            aud: credential.token_uri(),
            iat: now,
            exp: now + self.lifetime,
        }
    }

    /// Builds and signs an assertion for the credential at the given time
    ///
    /// # Errors
    ///
    /// * [`BuildError::ClockNotSet`] if `now` is earlier than the clock floor
    /// * [`BuildError::Signing`] if the key cannot produce a signature
    pub fn build(&self, credential: &Credential, now: UnixTime) -> Result<Jwt, BuildError> {
        if now < self.clock_floor {
            return Err(BuildError::ClockNotSet {
                now,
                floor: self.clock_floor,
            });
        }

        let headers = BasicHeaders::new(jws::Algorithm::RS256).with_type("JWT");
        let claims = self.claims(credential, now);

        let jwt = Jwt::try_from_parts_with_signature(&headers, &claims, credential.private_key())?;

        tracing::debug!(
            iss = %claims.iss,
            scope = claims.scope,
            iat = claims.iat.0,
            exp = claims.exp.0,
            "signed assertion"
        );

        Ok(jwt)
    }
}

/// Builds an hour-long assertion for the credential at the given time
///
/// # Errors
///
/// As for [`AssertionBuilder::build()`].
pub fn build(credential: &Credential, now: UnixTime) -> Result<Jwt, BuildError> {
    AssertionBuilder::default().build(credential, now)
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use sigil::jwt::HasAlgorithm;

    use super::*;
    use crate::test::*;

    fn credential() -> Result<Credential> {
        Ok(Credential::parse(service_account_json().as_bytes())?)
    }

    #[test]
    fn claims_in_fixed_order() -> Result<()> {
        let credential = credential()?;
        let builder = AssertionBuilder::default();
        let json = serde_json::to_string(&builder.claims(&credential, UnixTime(1700000000)))?;

        assert_eq!(
            json,
            concat!(
                r#"{"iss":"sensor-17@fleet-demo.iam.gserviceaccount.com","#,
                r#""scope":"https://www.googleapis.com/auth/cloud-platform","#,
                r#""aud":"https://oauth2.googleapis.com/token","#,
                r#""iat":1700000000,"exp":1700003600}"#,
            )
        );
        Ok(())
    }

    #[test]
    fn header_declares_rs256_jwt() -> Result<()> {
        let jwt = build(&credential()?, UnixTime(1700000000))?;
        let decomposed = jwt.decompose::<BasicHeaders>()?;

        assert_eq!(decomposed.untrusted_header().alg(), jws::Algorithm::RS256);
        assert_eq!(decomposed.untrusted_header().typ(), Some("JWT"));
        assert_eq!(
            jwt.as_str().split('.').next(),
            Some("eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9")
        );
        Ok(())
    }

    #[test]
    fn repeated_builds_are_identical() -> Result<()> {
        let credential = credential()?;
        let first = build(&credential, UnixTime(1700000000))?;
        let second = build(&credential, UnixTime(1700000000))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn scope_precedence() -> Result<()> {
        let mut doc: serde_json::Value = serde_json::from_str(&service_account_json())?;
        doc["scope"] = "https://www.googleapis.com/auth/pubsub".into();
        let with_doc_scope = Credential::parse(doc.to_string().as_bytes())?;
        let without = credential()?;

        let plain = AssertionBuilder::default();
        assert_eq!(plain.scope_for(&without), DEFAULT_SCOPE);
        assert_eq!(
            plain.scope_for(&with_doc_scope),
            "https://www.googleapis.com/auth/pubsub"
        );

        let overridden = AssertionBuilder::default().with_scope(Some("a,b  c"));
        assert_eq!(overridden.scope_for(&with_doc_scope), "a b c");
        assert_eq!(overridden.scope_for(&without), "a b c");
        Ok(())
    }

    #[test]
    fn clock_below_floor_is_rejected() -> Result<()> {
        let credential = credential()?;

        let err = build(&credential, UnixTime(0)).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ClockNotSet {
                now: UnixTime(0),
                floor: UnixTime(1000)
            }
        ));

        let jwt = build(&credential, UnixTime(1000))?;
        assert_eq!(jwt.as_str().split('.').count(), 3);
        Ok(())
    }

    #[test]
    fn small_key_is_reported() -> Result<()> {
        let credential =
            Credential::parse(service_account_json_with_key(PRIVATE_KEY_480).as_bytes())?;

        let err = build(&credential, UnixTime(1700000000)).unwrap_err();
        assert!(err.is_key_too_small());
        Ok(())
    }

    #[test]
    fn lifetime_is_capped() -> Result<()> {
        let credential = credential()?;
        let builder = AssertionBuilder::default().with_lifetime(DurationSecs(86400));
        let claims = builder.claims(&credential, UnixTime(5000));
        assert_eq!(claims.exp, UnixTime(8600));
        Ok(())
    }
}
