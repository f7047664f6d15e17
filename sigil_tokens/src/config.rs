//! Token manager configuration
//!
//! Everything a device needs to obtain tokens can be supplied as one
//! serializable [`SignerConfig`], typically read from a JSON file alongside
//! the firmware.

use serde::{Deserialize, Serialize};

use crate::{
    backoff::ErrorBackoffConfig, credentials::CredentialSource, storage,
    tokens::TokenLifetimeConfig, transport::TrustConfig,
};

/// The scope requested when neither the configuration nor the
/// service-account document names one
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Configuration for a token manager
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Where the service account comes from
    pub credentials: CredentialSource,

    /// Scopes to request, separated by spaces or commas
    ///
    /// Takes precedence over any scope in the service-account document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<String>,

    /// How the token endpoint's certificate is checked
    #[serde(default)]
    pub trust: TrustConfig,

    /// Refresh and assertion timing
    #[serde(default)]
    pub lifetime: TokenLifetimeConfig,

    /// Delays between failed attempts
    #[serde(default)]
    pub backoff: ErrorBackoffConfig,

    /// The largest credential or certificate file that will be read
    #[serde(default = "default_max_file_len")]
    pub max_file_len: usize,
}

fn default_max_file_len() -> usize {
    storage::MAX_FILE_LEN
}

impl SignerConfig {
    /// A configuration with default settings for the given credentials
    pub fn new(credentials: CredentialSource) -> Self {
        Self {
            credentials,
            scopes: None,
            trust: TrustConfig::default(),
            lifetime: TokenLifetimeConfig::default(),
            backoff: ErrorBackoffConfig::default(),
            max_file_len: storage::MAX_FILE_LEN,
        }
    }

    /// Sets the scopes to request
    pub fn with_scopes(mut self, scopes: impl AsRef<str>) -> Self {
        let scopes = normalize_scopes(scopes.as_ref());
        self.scopes = if scopes.is_empty() { None } else { Some(scopes) };
        self
    }

    /// Sets how the token endpoint's certificate is checked
    pub fn with_trust(mut self, trust: TrustConfig) -> Self {
        self.trust = trust;
        self
    }

    /// Sets refresh and assertion timing
    pub fn with_lifetime(mut self, lifetime: TokenLifetimeConfig) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Sets the delays between failed attempts
    pub fn with_backoff(mut self, backoff: ErrorBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the largest credential or certificate file that will be read
    pub fn with_max_file_len(mut self, max_file_len: usize) -> Self {
        self.max_file_len = max_file_len;
        self
    }
}

/// Normalizes a scope list to the single-space separated form
///
/// ```
/// use sigil_tokens::config::normalize_scopes;
///
/// assert_eq!(
///     normalize_scopes(" scope.a,scope.b  scope.c "),
///     "scope.a scope.b scope.c",
/// );
/// ```
#[must_use]
pub fn normalize_scopes(scopes: &str) -> String {
    scopes
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use sigil_clock::DurationSecs;

    use super::*;
    use crate::storage::StorageKind;

    #[test]
    fn empty_scopes_are_dropped() {
        let config = SignerConfig::new(CredentialSource::document("{}")).with_scopes(" , ");
        assert_eq!(config.scopes, None);
    }

    #[test]
    fn reads_minimal_json() -> Result<()> {
        let config: SignerConfig = serde_json::from_str(
            r#"{
                "credentials": { "source": "file", "path": "/sa.json", "storage": "sd" },
                "scopes": "https://www.googleapis.com/auth/pubsub",
                "lifetime": { "refresh_margin": 120 },
                "backoff": { "base_delay": 1000, "max_delay": 5000 }
            }"#,
        )?;

        match &config.credentials {
            CredentialSource::File { path, storage } => {
                assert_eq!(path, "/sa.json");
                assert_eq!(*storage, StorageKind::Sd);
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(config.lifetime.refresh_margin(), DurationSecs(120));
        assert_eq!(config.lifetime.assertion_lifetime(), DurationSecs(3600));
        assert_eq!(config.trust, TrustConfig::SystemRoots);
        assert_eq!(config.backoff.max_delay(), std::time::Duration::from_secs(5));
        assert_eq!(config.max_file_len, storage::MAX_FILE_LEN);
        Ok(())
    }
}
