//! Network capability used for token exchange
//!
//! The token manager never opens sockets itself. It drives a [`Transport`],
//! a blocking, byte-oriented TLS client connection that each platform
//! supplies. [`TlsTransport`] is the implementation for hosts with
//! `std::net`; [`mock::MockTransport`] stands in for the network in tests.

use std::{io, time::Duration};

use serde::{Deserialize, Serialize};

use crate::storage::{self, Storage, StorageKind};

pub mod mock;
#[cfg(feature = "rustls")]
#[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
mod tls;

#[cfg(feature = "rustls")]
#[cfg_attr(docsrs, doc(cfg(feature = "rustls")))]
pub use tls::TlsTransport;

/// A blocking TLS client connection
///
/// At most one connection is open at a time. Reads and writes operate on
/// the decrypted application stream.
pub trait Transport {
    /// Opens a connection to `host` on `port`, completing the TLS handshake
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()>;

    /// Whether a connection is open, or closed with unread data remaining
    fn connected(&self) -> bool;

    /// Writes some bytes, returning how many were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads buffered bytes, returning `0` if none are available yet
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// The number of bytes that can be read without blocking
    fn available(&mut self) -> io::Result<usize>;

    /// Closes the connection, if any
    fn stop(&mut self);

    /// Bounds how long connecting and writing may block
    fn set_timeout(&mut self, timeout: Duration);

    /// Sets how the server's certificate is checked on the next connection
    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()>;

    /// Whether the underlying network link is up
    fn network_ready(&self) -> bool {
        true
    }

    /// Asks the platform to bring the network link back up
    fn reconnect(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for &'_ mut T {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        (**self).connect(host, port)
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        (**self).set_trust(trust)
    }

    fn network_ready(&self) -> bool {
        (**self).network_ready()
    }

    fn reconnect(&mut self) {
        (**self).reconnect()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        (**self).connect(host, port)
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        (**self).set_trust(trust)
    }

    fn network_ready(&self) -> bool {
        (**self).network_ready()
    }

    fn reconnect(&mut self) {
        (**self).reconnect()
    }
}

/// How the token endpoint's certificate should be checked, as configured
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrustConfig {
    /// Accept any certificate
    ///
    /// Only suitable for testing against local endpoints.
    Insecure,
    /// Trust the bundled public root certificates
    #[default]
    SystemRoots,
    /// Trust the given PEM-encoded CA certificates
    CaCertPem {
        /// One or more `CERTIFICATE` PEM blocks
        pem: String,
    },
    /// Trust CA certificates read from storage
    CaCertFile {
        /// The device path of the PEM file
        path: String,
        /// Which medium holds the file
        #[serde(default)]
        storage: StorageKind,
    },
}

impl TrustConfig {
    /// Whether resolving this configuration reads from storage
    #[must_use]
    pub fn needs_storage(&self) -> bool {
        matches!(self, Self::CaCertFile { .. })
    }

    /// Resolves the configuration into a trust anchor, reading any file
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate file cannot be read, is larger than
    /// `max_len` bytes, or is not text.
    pub fn resolve<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        max_len: usize,
    ) -> io::Result<TrustAnchor> {
        match self {
            Self::Insecure => Ok(TrustAnchor::Insecure),
            Self::SystemRoots => Ok(TrustAnchor::SystemRoots),
            Self::CaCertPem { pem } => Ok(TrustAnchor::CaCertPem(pem.clone())),
            Self::CaCertFile {
                path,
                storage: kind,
            } => {
                let data = storage::read_to_end(storage, *kind, path, max_len)?;
                let pem = String::from_utf8(data)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(TrustAnchor::CaCertPem(pem))
            }
        }
    }
}

/// How the token endpoint's certificate is checked, ready for a transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustAnchor {
    /// Accept any certificate
    Insecure,
    /// Trust the bundled public root certificates
    SystemRoots,
    /// Trust the given PEM-encoded CA certificates
    CaCertPem(String),
}
