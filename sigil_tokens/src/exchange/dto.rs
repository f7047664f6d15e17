//! DTOs for the token endpoint

use serde::{Deserialize, Serialize};
use sigil_clock::DurationSecs;

use crate::AccessTokenRef;

/// A successful token response
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse<'a> {
    /// The granted access token
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    /// The token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Seconds until the token expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
}

/// An OAuth error body
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ErrorResponse {
    /// The OAuth error code, such as `invalid_grant`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}
