//! Uid-keyed keystore for the public-key mechanism.
//!
//! A keystore is a directory holding one keypair per user: `<uid>.key`
//! (the 32-byte ed25519 secret, mode 0600) and `<uid>.pub` (the 32-byte
//! verifying key). Secret material is rejected when group/other permission
//! bits are set on the key file, and is only ever held in zeroizing
//! containers.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use zeroize::Zeroizing;

use crate::error::KeystoreError;

/// Directory of per-uid ed25519 key material.
#[derive(Debug, Clone)]
pub struct Keystore {
    dir: PathBuf,
}

impl Keystore {
    /// Opens a keystore rooted at `dir`. The directory is not required to
    /// exist until key material is read or written.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the secret key file for `userid`.
    #[must_use]
    pub fn signing_key_path(&self, userid: u32) -> PathBuf {
        self.dir.join(format!("{userid}.key"))
    }

    /// Path of the public key file for `userid`.
    #[must_use]
    pub fn verifying_key_path(&self, userid: u32) -> PathBuf {
        self.dir.join(format!("{userid}.pub"))
    }

    /// Loads the signing key for `userid`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no key is stored for the user, and the
    /// errors of [`load_signing_key_file`](Self::load_signing_key_file)
    /// otherwise.
    pub fn load_signing_key(&self, userid: u32) -> Result<SigningKey, KeystoreError> {
        let path = self.signing_key_path(userid);
        if !path.exists() {
            return Err(KeystoreError::NotFound { userid });
        }
        Self::load_signing_key_file(&path)
    }

    /// Loads a signing key from an explicit path (the `cert-path` config
    /// override).
    ///
    /// # Errors
    ///
    /// Returns `InsecurePermissions` when group/other bits are set on the
    /// file, `InvalidKey` when the content is not exactly a 32-byte
    /// secret, or `Io` on read failure.
    pub fn load_signing_key_file(path: &Path) -> Result<SigningKey, KeystoreError> {
        let metadata = fs::metadata(path).map_err(|source| KeystoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.permissions().mode() & 0o077 != 0 {
            return Err(KeystoreError::InsecurePermissions {
                path: path.to_path_buf(),
            });
        }
        if metadata.len() != SECRET_KEY_LENGTH as u64 {
            return Err(KeystoreError::InvalidKey {
                path: path.to_path_buf(),
                reason: format!("expected {SECRET_KEY_LENGTH} bytes, found {}", metadata.len()),
            });
        }

        let mut file = File::open(path).map_err(|source| KeystoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
        file.read_exact(&mut *secret)
            .map_err(|source| KeystoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(SigningKey::from_bytes(&secret))
    }

    /// Loads the verifying key for `userid`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no public key is stored for the user,
    /// `InvalidKey` for malformed content, or `Io` on read failure.
    pub fn load_verifying_key(&self, userid: u32) -> Result<VerifyingKey, KeystoreError> {
        let path = self.verifying_key_path(userid);
        if !path.exists() {
            return Err(KeystoreError::NotFound { userid });
        }
        let bytes = fs::read(&path).map_err(|source| KeystoreError::Io {
            path: path.clone(),
            source,
        })?;
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeystoreError::InvalidKey {
                    path: path.clone(),
                    reason: format!("expected {PUBLIC_KEY_LENGTH} bytes, found {}", bytes.len()),
                })?;
        VerifyingKey::from_bytes(&arr).map_err(|e| KeystoreError::InvalidKey {
            path,
            reason: e.to_string(),
        })
    }

    /// Generates and stores a fresh keypair for `userid`, creating the
    /// keystore directory (mode 0700) as needed. Used by provisioning
    /// tooling and tests.
    ///
    /// # Errors
    ///
    /// Returns `Io` when a key file already exists for the user or cannot
    /// be written.
    pub fn generate(&self, userid: u32) -> Result<SigningKey, KeystoreError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|source| KeystoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)).map_err(
                |source| KeystoreError::Io {
                    path: self.dir.clone(),
                    source,
                },
            )?;
        }

        let mut rng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut rng);

        let key_path = self.signing_key_path(userid);
        let secret = Zeroizing::new(signing_key.to_bytes());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&key_path)
            .map_err(|source| KeystoreError::Io {
                path: key_path.clone(),
                source,
            })?;
        file.write_all(&*secret)
            .and_then(|()| file.sync_all())
            .map_err(|source| KeystoreError::Io {
                path: key_path.clone(),
                source,
            })?;

        let pub_path = self.verifying_key_path(userid);
        fs::write(&pub_path, signing_key.verifying_key().as_bytes()).map_err(|source| {
            KeystoreError::Io {
                path: pub_path,
                source,
            }
        })?;

        Ok(signing_key)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn generate_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path().join("keys"));

        let generated = store.generate(1000).unwrap();
        let loaded = store.load_signing_key(1000).unwrap();
        assert_eq!(loaded.to_bytes(), generated.to_bytes());

        let public = store.load_verifying_key(1000).unwrap();
        assert_eq!(public, generated.verifying_key());
    }

    #[test]
    fn secret_file_has_0600_permissions() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path().join("keys"));
        store.generate(1000).unwrap();

        let mode = fs::metadata(store.signing_key_path(1000))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path());
        assert!(matches!(
            store.load_signing_key(42),
            Err(KeystoreError::NotFound { userid: 42 })
        ));
        assert!(matches!(
            store.load_verifying_key(42),
            Err(KeystoreError::NotFound { userid: 42 })
        ));
    }

    #[test]
    fn lax_permissions_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path());
        store.generate(1000).unwrap();

        let path = store.signing_key_path(1000);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            store.load_signing_key(1000),
            Err(KeystoreError::InsecurePermissions { .. })
        ));
    }

    #[test]
    fn truncated_secret_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path());
        let path = store.signing_key_path(7);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        drop(file);

        assert!(matches!(
            store.load_signing_key(7),
            Err(KeystoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn malformed_public_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path());
        fs::write(store.verifying_key_path(7), b"short").unwrap();
        assert!(matches!(
            store.load_verifying_key(7),
            Err(KeystoreError::InvalidKey { .. })
        ));
    }

    #[test]
    fn duplicate_generate_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Keystore::new(dir.path());
        store.generate(1000).unwrap();
        assert!(matches!(
            store.generate(1000),
            Err(KeystoreError::Io { .. })
        ));
    }
}
