//! Persistence of found keys in Tor's on-disk secret key format.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::worker::FoundKey;

/// Header Tor expects at the start of an `hs_ed25519_secret_key` file.
const FILE_HEADER: &[u8; 32] = b"== ed25519v1-secret: type0 ==\0\0\0";

/// Errors raised while persisting a found key.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("output directory {0} is not usable: {1}")]
    Directory(PathBuf, #[source] std::io::Error),
    #[error("failed to write key file {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}

/// Writes found keys into a directory, one file per address.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Opens a store rooted at `dir`, creating the directory if needed
    /// and verifying it is writable before any search starts.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Directory(dir.clone(), e))?;
        let probe = dir.join(".write-probe");
        fs::write(&probe, b"").map_err(|e| StoreError::Directory(dir.clone(), e))?;
        let _ = fs::remove_file(&probe);
        Ok(Self { dir })
    }

    /// Returns the directory keys are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists a found key and returns the path it was written to.
    ///
    /// The file is named after the address (`<body>.onion`) and holds
    /// the 32-byte header followed by the 64-byte expanded secret key.
    /// Content is written to a temporary name and renamed into place,
    /// so a crash never leaves a truncated file under the final name.
    /// Saving the same address twice is a no-op returning the existing
    /// path, since the content is fully determined by the address.
    pub fn save(&self, found: &FoundKey) -> Result<PathBuf, StoreError> {
        let path = self.dir.join(found.address.to_onion());
        if path.exists() {
            return Ok(path);
        }

        let tmp = self.dir.join(format!(".{}.tmp", found.address.body()));
        let write = |tmp: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(tmp)?;
            file.write_all(FILE_HEADER)?;
            file.write_all(&found.keypair.expanded_secret_key())?;
            file.sync_all()
        };
        write(&tmp).map_err(|e| StoreError::Write(path.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Write(path.clone(), e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, OnionAddress};
    use crate::matcher::{Pattern, PatternPosition};
    use std::time::SystemTime;

    fn sample_found() -> FoundKey {
        let keypair = Keypair::from_seed([7u8; 32]);
        let address = OnionAddress::from_public_key(keypair.public_key());
        FoundKey {
            pattern: Pattern::new("a", PatternPosition::Prefix).unwrap(),
            address,
            keypair,
            discovered_at: SystemTime::now(),
        }
    }

    #[test]
    fn saves_header_and_expanded_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let found = sample_found();

        let path = store.save(&found).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            found.address.to_onion()
        );

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 96);
        assert_eq!(&content[..32], FILE_HEADER);
        assert_eq!(&content[32..], &found.keypair.expanded_secret_key());
    }

    #[test]
    fn save_is_idempotent_per_address() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        let found = sample_found();

        let first = store.save(&found).unwrap();
        let second = store.save(&found).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("keys/out");
        let store = KeyStore::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.dir(), nested);
    }

    #[test]
    fn open_rejects_unwritable_path() {
        // A regular file cannot act as the output directory.
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            KeyStore::open(&file),
            Err(StoreError::Directory(_, _))
        ));
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::open(dir.path()).unwrap();
        store.save(&sample_found()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
