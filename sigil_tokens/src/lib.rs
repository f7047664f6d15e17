//! Service-account access tokens for poll-driven devices
//!
//! This library keeps an OAuth 2.0 access token fresh on behalf of a
//! service account, using the JWT-bearer grant: the device signs a short-lived
//! assertion with the account's RSA key and trades it at the token endpoint
//! for an access token.
//!
//! Everything happens synchronously inside [`TokenManager::tick()`], which
//! the host calls from its main loop. There are no background threads. The
//! network, the filesystem and the clock are supplied as collaborators, so
//! the same manager runs against a real TLS stack on a host or against
//! scripted mocks in tests.
//!
//! # General Flow
//!
//! ```
//! use sigil_clock::System;
//! use sigil_tokens::{
//!     config::SignerConfig,
//!     credentials::CredentialSource,
//!     exchange::HttpTokenExchange,
//!     storage::{FileStorage, StorageKind},
//!     transport::mock::MockTransport,
//!     TokenManager,
//! };
//!
//! let config = SignerConfig::new(CredentialSource::file(
//!     "service_account.json",
//!     StorageKind::Flash,
//! ))
//! .with_scopes("https://www.googleapis.com/auth/pubsub");
//!
//! let exchange = HttpTokenExchange::new(MockTransport::new());
//! let storage = FileStorage::new().with_flash_root("/var/lib/device");
//!
//! let mut manager = TokenManager::new(exchange, storage, System);
//! manager.begin(config);
//!
//! # /* Commented out due to this trying to interact with the world.
//! loop {
//!     manager.tick();
//!     if manager.token_ready() {
//!         publish_reading(manager.access_token());
//!     }
//! }
//! # */
//! ```
//!
//! On hosts with `std::net`, use [`transport::TlsTransport`] in place of the
//! mock. The `poll_loop` example shows a complete host loop.
//!
//! # Features
//!
//! * `rustls` (default): Provides [`transport::TlsTransport`], a transport
//!   built on `std::net` and [rustls].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod assertion;
pub mod backoff;
mod braids;
pub mod config;
pub mod credentials;
pub mod exchange;
mod manager;
pub mod status;
pub mod storage;
mod tokens;
pub mod transport;

pub use braids::*;
pub use manager::{RefreshJob, RefreshOutcome, StatusCallback, TokenManager};
pub use tokens::{
    IssuedToken, TokenLifetimeConfig, TokenState, TokenStatus, MAX_ASSERTION_LIFETIME,
};
