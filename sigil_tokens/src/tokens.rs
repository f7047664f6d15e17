use std::fmt;

use serde::{Deserialize, Serialize};
use sigil_clock::{DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// The longest assertion lifetime token endpoints accept
pub const MAX_ASSERTION_LIFETIME: DurationSecs = DurationSecs(3600);

/// Where the token manager is in its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    /// No token has been requested yet
    #[default]
    Uninitialized,
    /// A token exchange is in flight
    Requesting,
    /// A token was issued and has not yet expired
    Ready,
    /// The last issued token has passed its expiry
    Expired,
    /// The last attempt failed
    Error,
}

impl TokenState {
    /// Lower-case name of the state, as reported to hosts
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Requesting => "requesting",
            Self::Ready => "ready",
            Self::Expired => "expired",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token as returned by the authority with some additional lifetime information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    access_token: AccessToken,
    token_type: String,
    lifetime: DurationSecs,
    issued: UnixTime,
    stale: UnixTime,
    expiry: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl IssuedToken {
    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the token type, typically `Bearer`
    #[inline]
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Gets the token's lifetime
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.lifetime
    }

    /// Gets the time that the assertion for this token was signed
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time that the token becomes due for refresh
    #[inline]
    pub fn stale(&self) -> UnixTime {
        self.stale
    }

    /// Gets the time that the token will expire
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// Gets the interval during which the token is valid
    #[inline]
    pub fn valid_interval(&self) -> std::ops::Range<UnixTime> {
        self.issued..self.expiry
    }

    /// Gets the token's lifetime status as of the provided time
    #[inline]
    pub fn token_status_at(&self, time: UnixTime) -> TokenStatus {
        if time < self.stale {
            TokenStatus::Fresh
        } else if time < self.expiry {
            TokenStatus::Stale
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expiry.saturating_duration_since(time)
    }
}

/// Configuration for token timing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenLifetimeConfig {
    refresh_margin: DurationSecs,
    assertion_lifetime: DurationSecs,
    clock_floor: UnixTime,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Refreshes 300 seconds before expiry, signs assertions valid for an
    /// hour, and treats any clock reading below 1000 as not yet set.
    fn default() -> Self {
        Self {
            refresh_margin: DurationSecs(300),
            assertion_lifetime: MAX_ASSERTION_LIFETIME,
            clock_floor: UnixTime(1000),
        }
    }
}

impl TokenLifetimeConfig {
    /// Sets how long before expiry a token becomes due for refresh
    pub fn with_refresh_margin(mut self, margin: DurationSecs) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Sets the lifetime of signed assertions, capped at one hour
    pub fn with_assertion_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.assertion_lifetime = lifetime.min(MAX_ASSERTION_LIFETIME);
        self
    }

    /// Sets the earliest clock reading accepted as a real time
    pub fn with_clock_floor(mut self, floor: UnixTime) -> Self {
        self.clock_floor = floor;
        self
    }

    /// How long before expiry a token becomes due for refresh
    #[must_use]
    pub fn refresh_margin(&self) -> DurationSecs {
        self.refresh_margin
    }

    /// The lifetime of signed assertions
    #[must_use]
    pub fn assertion_lifetime(&self) -> DurationSecs {
        self.assertion_lifetime.min(MAX_ASSERTION_LIFETIME)
    }

    /// The earliest clock reading accepted as a real time
    #[must_use]
    pub fn clock_floor(&self) -> UnixTime {
        self.clock_floor
    }

    /// Whether `now` is a plausible wall-clock reading
    #[must_use]
    pub fn clock_is_set(&self, now: UnixTime) -> bool {
        now >= self.clock_floor
    }

    fn time_to_stale(&self, issued: UnixTime, valid_duration: DurationSecs) -> UnixTime {
        // A token shorter-lived than twice the margin is refreshed halfway
        // through its life instead of immediately.
        let margin = self.refresh_margin.min(DurationSecs(valid_duration.0 / 2));
        issued + (valid_duration - margin)
    }

    /// Given an access token and its lifetime, constructs a token with a lifetime
    ///
    /// `issued` is the time the assertion was signed, so that expiry is never
    /// later than the authority intended.
    pub fn create_token<A>(
        &self,
        access_token: A,
        token_type: impl Into<String>,
        valid_duration: DurationSecs,
        issued: UnixTime,
    ) -> IssuedToken
    where
        A: AsRef<AccessTokenRef>,
    {
        IssuedToken {
            access_token: access_token.as_ref().to_owned(),
            token_type: token_type.into(),
            lifetime: valid_duration,
            issued,
            stale: self.time_to_stale(issued, valid_duration),
            expiry: issued + valid_duration,
        }
    }
}
