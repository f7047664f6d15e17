//! File access for credentials and certificates
//!
//! Devices typically carry the service-account document either in onboard
//! flash or on a removable card. Both are reached through [`Storage`], an
//! open/read/close capability, so that the token manager never depends on a
//! particular filesystem.

use std::{
    collections::HashMap,
    fs, io,
    io::Read,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// The medium a file lives on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Onboard flash filesystem
    #[default]
    Flash,
    /// Removable SD card
    Sd,
}

/// A read-only file capability
///
/// Only one file is open at a time. Paths are given in device form, rooted
/// at `/`; see [`normalize_path()`].
pub trait Storage {
    /// Opens the named file, returning its size in bytes
    ///
    /// Any previously opened file is closed first.
    fn open(&mut self, kind: StorageKind, path: &str) -> io::Result<usize>;

    /// Reads from the open file, returning `0` at end of file
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Closes the open file, if any
    fn close(&mut self);
}

impl<S: Storage + ?Sized> Storage for &'_ mut S {
    fn open(&mut self, kind: StorageKind, path: &str) -> io::Result<usize> {
        (**self).open(kind, path)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn open(&mut self, kind: StorageKind, path: &str) -> io::Result<usize> {
        (**self).open(kind, path)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Ensures a storage path begins with `/`
///
/// ```
/// use sigil_tokens::storage::normalize_path;
///
/// assert_eq!(normalize_path("service_account.json"), "/service_account.json");
/// assert_eq!(normalize_path("/certs/ca.pem"), "/certs/ca.pem");
/// ```
#[must_use]
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        let mut normalized = String::with_capacity(path.len() + 1);
        normalized.push('/');
        normalized.push_str(path);
        normalized
    }
}

/// The default limit on files read through [`read_to_end()`]
///
/// Service-account documents and CA bundles are a few kilobytes.
pub const MAX_FILE_LEN: usize = 64 * 1024;

/// Reads an entire file through a [`Storage`] capability
///
/// The file is closed again whether or not the read succeeds.
///
/// # Errors
///
/// Returns any error reported by the storage, [`io::ErrorKind::InvalidData`]
/// if the file reports more than `max_len` bytes on open, or
/// [`io::ErrorKind::UnexpectedEof`] if fewer bytes are read than reported.
pub fn read_to_end<S: Storage + ?Sized>(
    storage: &mut S,
    kind: StorageKind,
    path: &str,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let path = normalize_path(path);
    let result = read_open_file(storage, kind, &path, max_len);
    storage.close();

    if let Ok(data) = &result {
        tracing::debug!(?kind, path = %path, len = data.len(), "read file from storage");
    }

    result
}

fn read_open_file<S: Storage + ?Sized>(
    storage: &mut S,
    kind: StorageKind,
    path: &str,
    max_len: usize,
) -> io::Result<Vec<u8>> {
    let len = storage.open(kind, path)?;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("file of {} bytes exceeds the {} byte limit", len, max_len),
        ));
    }
    let mut data = vec![0; len];
    let mut filled = 0;
    while filled < len {
        match storage.read(&mut data[filled..])? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => filled += n,
        }
    }
    Ok(data)
}

/// Storage backed by directories on the host filesystem
///
/// Each [`StorageKind`] maps to a root directory. Device paths are resolved
/// beneath their root.
#[derive(Debug, Default)]
pub struct FileStorage {
    flash_root: Option<PathBuf>,
    sd_root: Option<PathBuf>,
    current: Option<fs::File>,
}

impl FileStorage {
    /// Constructs storage with no media mounted
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `root` as the flash filesystem
    pub fn with_flash_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.flash_root = Some(root.into());
        self
    }

    /// Mounts `root` as the SD card
    pub fn with_sd_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sd_root = Some(root.into());
        self
    }

    fn root(&self, kind: StorageKind) -> Option<&Path> {
        match kind {
            StorageKind::Flash => self.flash_root.as_deref(),
            StorageKind::Sd => self.sd_root.as_deref(),
        }
    }
}

impl Storage for FileStorage {
    fn open(&mut self, kind: StorageKind, path: &str) -> io::Result<usize> {
        self.close();

        let root = self.root(kind).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no {:?} storage mounted", kind),
            )
        })?;

        let full = root.join(path.trim_start_matches('/'));
        let file = fs::File::open(&full)?;
        let len = file.metadata()?.len();
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large"))?;

        self.current = Some(file);
        Ok(len)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.current {
            Some(file) => file.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no file open")),
        }
    }

    fn close(&mut self) {
        self.current = None;
    }
}

/// In-memory storage, primarily for tests
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    files: HashMap<(StorageKind, String), Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
    opens: usize,
}

impl MemoryStorage {
    /// Constructs empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a file on the given medium
    pub fn with_file(
        mut self,
        kind: StorageKind,
        path: &str,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        self.insert(kind, path, contents);
        self
    }

    /// Places or replaces a file on the given medium
    pub fn insert(&mut self, kind: StorageKind, path: &str, contents: impl Into<Vec<u8>>) {
        self.files
            .insert((kind, normalize_path(path)), contents.into());
    }

    /// The number of times a file has been successfully opened
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens
    }
}

impl Storage for MemoryStorage {
    fn open(&mut self, kind: StorageKind, path: &str) -> io::Result<usize> {
        self.close();

        let data = self
            .files
            .get(&(kind, normalize_path(path)))
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;

        let len = data.len();
        self.current = Some((data, 0));
        self.opens += 1;
        Ok(len)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (data, pos) = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no file open"))?;

        let remaining = &data[*pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        *pos += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn memory_storage_reads_back_with_or_without_slash() -> Result<()> {
        let mut storage =
            MemoryStorage::new().with_file(StorageKind::Sd, "key.json", b"{}".to_vec());

        assert_eq!(read_to_end(&mut storage, StorageKind::Sd, "/key.json", MAX_FILE_LEN)?, b"{}");
        assert_eq!(read_to_end(&mut storage, StorageKind::Sd, "key.json", MAX_FILE_LEN)?, b"{}");
        assert_eq!(storage.open_count(), 2);
        Ok(())
    }

    #[test]
    fn wrong_medium_is_not_found() {
        let mut storage =
            MemoryStorage::new().with_file(StorageKind::Sd, "key.json", b"{}".to_vec());

        let err = read_to_end(&mut storage, StorageKind::Flash, "key.json", MAX_FILE_LEN).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn oversized_file_is_refused_unread() {
        let mut storage =
            MemoryStorage::new().with_file(StorageKind::Sd, "key.json", vec![b' '; 4097]);

        let err = read_to_end(&mut storage, StorageKind::Sd, "key.json", 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("4097"));
    }

    #[test]
    fn file_storage_resolves_beneath_root() -> Result<()> {
        let root = std::env::temp_dir().join(format!("sigil-storage-{}", std::process::id()));
        fs::create_dir_all(&root)?;
        fs::write(root.join("ca.pem"), b"-----BEGIN CERTIFICATE-----")?;

        let mut storage = FileStorage::new().with_flash_root(&root);
        let data = read_to_end(&mut storage, StorageKind::Flash, "ca.pem", MAX_FILE_LEN)?;
        assert_eq!(data, b"-----BEGIN CERTIFICATE-----");

        let err = read_to_end(&mut storage, StorageKind::Sd, "ca.pem", MAX_FILE_LEN).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
